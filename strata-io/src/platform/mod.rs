use std::sync::Arc;

use crate::error::PlatformError;
use log::warn;
use once_cell::sync::Lazy;

#[cfg(target_os = "linux")]
pub mod linux;

/// Access to the machine's NUMA capabilities: topology queries, raw
/// memory placement and best-effort thread pinning.
///
/// Addresses cross this boundary as `usize` handles. They are only
/// valid between the allocating call and the matching release call, and
/// must be released through the same path they were obtained from
/// (`map_anonymous`/`unmap`, `allocate_on_node`/`free_on_node`).
pub trait Platform: Send + Sync {
    /// Number of NUMA nodes on this machine, at least 1.
    fn node_count(&self) -> usize;

    /// Node on which the calling thread is currently running.
    fn current_node(&self) -> usize;

    /// True when the machine exposes more than one NUMA node.
    fn numa_available(&self) -> bool;

    /// Node owning the page that contains `addr`. The page must have
    /// been faulted in, or the kernel cannot attribute it to a node.
    fn node_of_address(&self, addr: usize) -> Result<usize, PlatformError>;

    /// Anonymous zero-filled mapping, placed wherever the OS decides.
    fn map_anonymous(&self, size: usize) -> Result<usize, PlatformError>;

    /// Release a mapping obtained from [`Platform::map_anonymous`].
    fn unmap(&self, addr: usize, size: usize);

    /// Zero-filled allocation bound to the given node.
    fn allocate_on_node(&self, size: usize, node: usize) -> Result<usize, PlatformError>;

    /// Release memory obtained from [`Platform::allocate_on_node`].
    fn free_on_node(&self, addr: usize, size: usize);

    /// Ask the OS to run the calling thread on the given node. Best
    /// effort: returns immediately, the migration may happen later or
    /// not at all. Callers that care must poll [`Platform::current_node`].
    fn pin_current_thread(&self, node: usize);

    /// Number of logical processors on this machine.
    fn processor_count(&self) -> usize;

    /// Node owning the given logical processor.
    fn node_of_processor(&self, cpu: usize) -> usize;
}

/// Rejects node ids outside `[0, node_count)`.
pub fn check_node(platform: &dyn Platform, node: usize) -> Result<(), PlatformError> {
    let available = platform.node_count();
    if node >= available {
        return Err(PlatformError::InvalidNode { node, available });
    }
    Ok(())
}

static CURRENT: Lazy<Arc<dyn Platform>> = Lazy::new(|| {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxPlatform::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(FallbackPlatform::new())
    }
});

/// The process-wide platform singleton, built on first use.
pub fn current() -> Arc<dyn Platform> {
    Arc::clone(&CURRENT)
}

/// Per-node logical processor counts, used to size node-pinned worker
/// pools.
pub fn processors_per_node(platform: &dyn Platform) -> Vec<usize> {
    let mut counts = vec![0usize; platform.node_count()];
    for cpu in 0..platform.processor_count() {
        let node = platform.node_of_processor(cpu);
        if node < counts.len() {
            counts[node] += 1;
        }
    }
    counts
}

/// Degraded platform for machines without NUMA introspection.
///
/// Behaves like a single-node (UMA) system: every address and every
/// processor reports node 0, pinning is a no-op and node-scoped
/// allocation is unavailable.
pub struct FallbackPlatform {
    processor_count: usize,
}

/// Alignment of fallback allocations, matching the mmap page size so
/// both backends hand out page-aligned chunks.
const FALLBACK_ALIGN: usize = 4096;

impl FallbackPlatform {
    pub fn new() -> Self {
        warn!("platform has no NUMA support, behaving as a single-node system");
        Self {
            processor_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    fn layout(size: usize) -> Result<std::alloc::Layout, PlatformError> {
        std::alloc::Layout::from_size_align(size, FALLBACK_ALIGN).map_err(|_| {
            PlatformError::AllocationFailed {
                size,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            }
        })
    }
}

impl Default for FallbackPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for FallbackPlatform {
    fn node_count(&self) -> usize {
        1
    }

    fn current_node(&self) -> usize {
        0
    }

    fn numa_available(&self) -> bool {
        false
    }

    fn node_of_address(&self, _addr: usize) -> Result<usize, PlatformError> {
        Ok(0)
    }

    fn map_anonymous(&self, size: usize) -> Result<usize, PlatformError> {
        if size == 0 {
            return Err(PlatformError::AllocationFailed {
                size,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            });
        }
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size and a valid alignment.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(PlatformError::AllocationFailed {
                size,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            });
        }
        Ok(ptr as usize)
    }

    fn unmap(&self, addr: usize, size: usize) {
        if addr == 0 || size == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(size) {
            // SAFETY: addr came from alloc_zeroed with this exact layout.
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }

    fn allocate_on_node(&self, _size: usize, node: usize) -> Result<usize, PlatformError> {
        check_node(self, node)?;
        Err(PlatformError::UnsupportedPlacement)
    }

    fn free_on_node(&self, _addr: usize, _size: usize) {
        // Nothing is ever handed out by allocate_on_node.
    }

    fn pin_current_thread(&self, _node: usize) {}

    fn processor_count(&self) -> usize {
        self.processor_count
    }

    fn node_of_processor(&self, _cpu: usize) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_single_node() {
        let p = FallbackPlatform::new();
        assert_eq!(p.node_count(), 1);
        assert_eq!(p.current_node(), 0);
        assert!(!p.numa_available());
        assert_eq!(p.node_of_address(0xdead_b000).unwrap(), 0);
        assert_eq!(p.node_of_processor(12), 0);
    }

    #[test]
    fn fallback_round_trips_memory() {
        let p = FallbackPlatform::new();
        let addr = p.map_anonymous(4096).unwrap();
        assert_ne!(addr, 0);
        // Mapped memory starts zeroed on every backend.
        let first = unsafe { std::ptr::read(addr as *const u8) };
        assert_eq!(first, 0);
        p.unmap(addr, 4096);
    }

    #[test]
    fn fallback_rejects_node_scoped_allocation() {
        let p = FallbackPlatform::new();
        assert!(matches!(
            p.allocate_on_node(4096, 0),
            Err(PlatformError::UnsupportedPlacement)
        ));
        assert!(matches!(
            p.allocate_on_node(4096, 99),
            Err(PlatformError::InvalidNode {
                node: 99,
                available: 1
            })
        ));
    }

    #[test]
    fn processor_counts_cover_every_cpu() {
        let p = FallbackPlatform::new();
        let counts = processors_per_node(&p);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0], p.processor_count());
    }
}
