//! Linux platform provider.
//!
//! Talks to the kernel directly instead of going through libnuma:
//! anonymous mappings via `mmap`, node placement via the `mbind`
//! syscall, placement queries via `move_pages` in query mode, and
//! thread pinning via `sched_setaffinity` over a node's CPU set.

use std::mem;
use std::num::NonZeroUsize;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};

use log::warn;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::PlatformError;
use crate::platform::{check_node, Platform};
use crate::topology::NodeTopology;

/// `MPOL_BIND`: strictly bind pages to the nodes in the mask.
const MPOL_BIND: i32 = 2;
/// `MPOL_MF_MOVE`: migrate already-faulted pages to the bound nodes.
const MPOL_MF_MOVE: u32 = 2;

const PAGE_SIZE: usize = 4096;

pub struct LinuxPlatform {
    topology: NodeTopology,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        let topology = NodeTopology::detect();
        topology.log_summary();
        Self { topology }
    }

    pub fn topology(&self) -> &NodeTopology {
        &self.topology
    }

    fn mmap(&self, size: usize) -> Result<usize, PlatformError> {
        let length = NonZeroUsize::new(size).ok_or_else(|| PlatformError::AllocationFailed {
            size,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;
        // SAFETY: a fresh anonymous private mapping with no address
        // hint cannot alias or clobber existing memory.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| PlatformError::AllocationFailed {
            size,
            source: std::io::Error::from_raw_os_error(errno as i32),
        })?;
        Ok(ptr.as_ptr() as usize)
    }

    fn munmap(&self, addr: usize, size: usize) {
        let Some(ptr) = NonNull::new(addr as *mut c_void) else {
            return;
        };
        // SAFETY: addr/size describe a live mapping produced by mmap,
        // and the one-shot release guard upstream prevents reuse.
        if let Err(errno) = unsafe { munmap(ptr, size) } {
            warn!("munmap({addr:#x}, {size}) failed: {errno}");
        }
    }

    /// Bind `[addr, addr + size)` to a single node.
    fn bind_to_node(&self, addr: usize, size: usize, node: usize) -> Result<(), PlatformError> {
        let nodemask = nodemask(node);
        // SAFETY: the region was just mapped and the nodemask outlives
        // the call; mbind reads, never retains, the mask pointer.
        let result = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr as *mut c_void,
                size,
                MPOL_BIND,
                nodemask.as_ptr(),
                nodemask.len() * 64, // maxnode: bits in the mask
                MPOL_MF_MOVE,
            )
        };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOMEM) {
                return Err(PlatformError::AllocationFailed { size, source: err });
            }
            // Anything else means the kernel cannot honor placement on
            // this machine; surfacing it lets the caller fall back to
            // an anonymous mapping.
            warn!("mbind to node {node} failed: {err}");
            return Err(PlatformError::UnsupportedPlacement);
        }
        Ok(())
    }

    /// Touch every page so the binding is materialized before anyone
    /// asks `move_pages` where the memory lives.
    fn prefault(&self, addr: usize, size: usize) {
        let base = addr as *mut u8;
        let mut offset = 0;
        while offset < size {
            // SAFETY: offset stays within the freshly mapped region.
            unsafe { ptr::write_volatile(base.add(offset), 0) };
            offset += PAGE_SIZE;
        }
    }
}

/// Single-node mbind mask: one bit per node, one u64 word per 64
/// nodes, so node ids beyond 63 stay representable.
fn nodemask(node: usize) -> Vec<u64> {
    let mut mask = vec![0u64; node / 64 + 1];
    mask[node / 64] = 1u64 << (node % 64);
    mask
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxPlatform {
    fn node_count(&self) -> usize {
        self.topology.node_count()
    }

    fn current_node(&self) -> usize {
        // SAFETY: sched_getcpu takes no pointers.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            return 0;
        }
        self.topology.node_of_processor(cpu as usize)
    }

    fn numa_available(&self) -> bool {
        self.topology.node_count() > 1
    }

    fn node_of_address(&self, addr: usize) -> Result<usize, PlatformError> {
        let page = addr as *mut c_void;
        let mut status: i32 = -1;
        // SAFETY: move_pages with a null node list only queries; the
        // pointers passed are live locals.
        let result = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0i32, // current process
                1usize,
                &page as *const *mut c_void,
                ptr::null::<i32>(), // query only
                &mut status as *mut i32,
                0i32,
            )
        };
        if result < 0 {
            return Err(PlatformError::AddressResolution {
                addr,
                source: std::io::Error::last_os_error(),
            });
        }
        if status < 0 {
            return Err(PlatformError::AddressResolution {
                addr,
                source: std::io::Error::from_raw_os_error(-status),
            });
        }
        Ok(status as usize)
    }

    fn map_anonymous(&self, size: usize) -> Result<usize, PlatformError> {
        self.mmap(size)
    }

    fn unmap(&self, addr: usize, size: usize) {
        self.munmap(addr, size);
    }

    fn allocate_on_node(&self, size: usize, node: usize) -> Result<usize, PlatformError> {
        check_node(self, node)?;
        let addr = self.mmap(size)?;
        if let Err(e) = self.bind_to_node(addr, size, node) {
            self.munmap(addr, size);
            return Err(e);
        }
        self.prefault(addr, size);
        Ok(addr)
    }

    fn free_on_node(&self, addr: usize, size: usize) {
        self.munmap(addr, size);
    }

    fn pin_current_thread(&self, node: usize) {
        let cpus = self.topology.processors_on_node(node);
        if cpus.is_empty() {
            warn!("cannot pin to node {node}: no processors on that node");
            return;
        }

        // SAFETY: cpu_set_t is a plain bitmask struct, valid when zeroed.
        let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };
        unsafe {
            libc::CPU_ZERO(&mut cpu_set);
            for &cpu in cpus {
                libc::CPU_SET(cpu, &mut cpu_set);
            }
        }

        // SAFETY: pid 0 is the calling thread; cpu_set is a live local.
        let ret =
            unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!("failed to pin thread to node {node}: {err} (running unpinned)");
        }
    }

    fn processor_count(&self) -> usize {
        self.topology.processor_count()
    }

    fn node_of_processor(&self, cpu: usize) -> usize {
        self.topology.node_of_processor(cpu)
    }
}
