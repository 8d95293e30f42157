use log::{info, warn};

/// NUMA topology of the machine: which logical processor belongs to
/// which memory node.
///
/// Detection reads sysfs on Linux and never fails; when sysfs is
/// missing or unparsable the result collapses to a single-node model,
/// which is also the only model available on non-Linux systems.
#[derive(Debug, Clone)]
pub struct NodeTopology {
    node_count: usize,
    processor_count: usize,
    /// Processor id -> node id.
    cpu_to_node: Vec<usize>,
    /// Node id -> processor ids on that node.
    cpus_per_node: Vec<Vec<usize>>,
}

impl NodeTopology {
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            match Self::detect_sysfs() {
                Ok(topo) => return topo,
                Err(e) => warn!("NUMA topology detection failed ({e}), assuming a single node"),
            }
        }

        Self::single_node()
    }

    /// Parse `/sys/devices/system/node/node*/cpulist`.
    #[cfg(target_os = "linux")]
    fn detect_sysfs() -> std::io::Result<Self> {
        use std::fs;
        use std::path::Path;

        let node_root = Path::new("/sys/devices/system/node");
        let mut node_ids = Vec::new();
        for entry in fs::read_dir(node_root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok()) {
                node_ids.push(id);
            }
        }
        if node_ids.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no node directories under /sys/devices/system/node",
            ));
        }
        node_ids.sort_unstable();
        let node_count = node_ids.last().map_or(1, |m| m + 1);

        let processor_count = online_processor_count();
        let mut cpu_to_node = vec![0usize; processor_count];
        let mut cpus_per_node = vec![Vec::new(); node_count];

        for node in node_ids {
            let cpulist = fs::read_to_string(node_root.join(format!("node{node}/cpulist")))?;
            let cpus = parse_cpulist(cpulist.trim());
            for &cpu in &cpus {
                if cpu < processor_count {
                    cpu_to_node[cpu] = node;
                }
            }
            cpus_per_node[node] = cpus;
        }

        Ok(Self {
            node_count,
            processor_count,
            cpu_to_node,
            cpus_per_node,
        })
    }

    fn single_node() -> Self {
        let processor_count = online_processor_count();
        Self {
            node_count: 1,
            processor_count,
            cpu_to_node: vec![0; processor_count],
            cpus_per_node: vec![(0..processor_count).collect()],
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn processor_count(&self) -> usize {
        self.processor_count
    }

    /// Node owning the given processor; 0 for an unknown processor id.
    pub fn node_of_processor(&self, cpu: usize) -> usize {
        self.cpu_to_node.get(cpu).copied().unwrap_or(0)
    }

    /// Processor ids on the given node; empty for an unknown node id.
    pub fn processors_on_node(&self, node: usize) -> &[usize] {
        self.cpus_per_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn log_summary(&self) {
        info!(
            "NUMA topology: {} node(s), {} logical processor(s)",
            self.node_count, self.processor_count
        );
        for node in 0..self.node_count {
            info!(
                "  node {}: {} processor(s) {:?}",
                node,
                self.processors_on_node(node).len(),
                self.processors_on_node(node)
            );
        }
    }
}

fn online_processor_count() -> usize {
    // SAFETY: sysconf takes no pointers and cannot fault.
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count <= 0 {
        warn!("failed to detect processor count, falling back to 1");
        1
    } else {
        count as usize
    }
}

/// Parse a sysfs CPU list such as "0-7,16-23" into processor ids.
fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}
