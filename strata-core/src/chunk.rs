//! Fixed-capacity off-heap blocks of `f64` values.
//!
//! A chunk owns raw memory obtained from the platform, either through
//! an anonymous mapping (placed by the OS, usually on the node of the
//! first writer) or through a node-scoped allocation. Release is
//! one-shot: the base address is atomically consumed, so an explicit
//! [`DirectChunk::release`] racing the `Drop` impl frees exactly once.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_io::{Platform, PlatformError};

use crate::error::AccessError;

/// Size of one stored element in bytes.
pub const ELEMENT_SIZE: usize = mem::size_of::<f64>();

/// How the chunk's memory was obtained, and therefore how it must be
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Mmap,
    NodeAlloc,
}

pub struct DirectChunk {
    /// Base address; swapped to 0 when the memory has been released.
    addr: AtomicUsize,
    capacity: usize,
    size_bytes: usize,
    /// Node the memory was requested on; `None` for "let the OS decide".
    node: Option<usize>,
    backing: Backing,
    platform: Arc<dyn Platform>,
}

impl DirectChunk {
    /// Anonymous-mapping chunk. The recorded node is where the calling
    /// thread happened to run; actual page placement follows the
    /// kernel's first-touch policy.
    pub fn of_mmap(platform: Arc<dyn Platform>, capacity: usize) -> Result<Self, PlatformError> {
        let size_bytes = capacity * ELEMENT_SIZE;
        let addr = platform.map_anonymous(size_bytes)?;
        let node = platform.current_node();
        Ok(Self {
            addr: AtomicUsize::new(addr),
            capacity,
            size_bytes,
            node: Some(node),
            backing: Backing::Mmap,
            platform,
        })
    }

    /// Node-scoped chunk, bound to `node` before anyone touches it.
    pub fn of_node_alloc(
        platform: Arc<dyn Platform>,
        capacity: usize,
        node: usize,
    ) -> Result<Self, PlatformError> {
        let size_bytes = capacity * ELEMENT_SIZE;
        let addr = platform.allocate_on_node(size_bytes, node)?;
        Ok(Self {
            addr: AtomicUsize::new(addr),
            capacity,
            size_bytes,
            node: Some(node),
            backing: Backing::NodeAlloc,
            platform,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Base address, for observability only. 0 once released. Must not
    /// be used for pointer arithmetic outside this chunk's bounds.
    pub fn address(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    /// Node this chunk was requested on.
    pub fn node_id(&self) -> Option<usize> {
        self.node
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Node the memory actually resides on, according to the platform.
    pub fn resolved_node(&self) -> Result<usize, PlatformError> {
        self.platform.node_of_address(self.address())
    }

    #[inline]
    fn base(&self) -> *mut f64 {
        let addr = self.addr.load(Ordering::Relaxed);
        debug_assert!(addr != 0, "access to a released chunk");
        addr as *mut f64
    }

    /// Bounds-checked read.
    pub fn read(&self, position: usize) -> Result<f64, AccessError> {
        if position >= self.capacity {
            return Err(AccessError::OutOfBounds {
                position,
                capacity: self.capacity,
            });
        }
        // SAFETY: position checked against capacity above.
        Ok(unsafe { self.read_unchecked(position) })
    }

    /// Bounds-checked write.
    pub fn write(&self, position: usize, value: f64) -> Result<(), AccessError> {
        if position >= self.capacity {
            return Err(AccessError::OutOfBounds {
                position,
                capacity: self.capacity,
            });
        }
        // SAFETY: position checked against capacity above.
        unsafe { self.write_unchecked(position, value) };
        Ok(())
    }

    /// Unchecked hot-path read.
    ///
    /// # Safety
    /// `position < capacity`, the chunk must not be released, and no
    /// other thread may be writing this position.
    #[inline]
    pub unsafe fn read_unchecked(&self, position: usize) -> f64 {
        debug_assert!(position < self.capacity);
        self.base().add(position).read()
    }

    /// Unchecked hot-path write.
    ///
    /// # Safety
    /// Same contract as [`DirectChunk::read_unchecked`], and the task
    /// running this write must be the chunk's only writer for the pass.
    #[inline]
    pub unsafe fn write_unchecked(&self, position: usize, value: f64) {
        debug_assert!(position < self.capacity);
        self.base().add(position).write(value);
    }

    /// Returns the memory to the platform. Idempotent: the address is
    /// consumed atomically, so concurrent or repeated calls (including
    /// the one from `Drop`) free at most once.
    pub fn release(&self) {
        let addr = self.addr.swap(0, Ordering::AcqRel);
        if addr == 0 {
            return;
        }
        match self.backing {
            Backing::Mmap => self.platform.unmap(addr, self.size_bytes),
            Backing::NodeAlloc => self.platform.free_on_node(addr, self.size_bytes),
        }
    }
}

impl Drop for DirectChunk {
    fn drop(&mut self) {
        self.release();
    }
}

/// Builds chunks of a requested capacity. A column creates all of its
/// chunks through one factory, which fixes their placement policy.
pub type ChunkFactory = Arc<dyn Fn(usize) -> Result<DirectChunk, PlatformError> + Send + Sync>;

/// Factory for anonymous-mapping chunks (placement left to the OS).
pub fn mmap_factory(platform: Arc<dyn Platform>) -> ChunkFactory {
    Arc::new(move |capacity| DirectChunk::of_mmap(platform.clone(), capacity))
}

/// Factory for chunks bound to a specific node.
pub fn node_alloc_factory(platform: Arc<dyn Platform>, node: usize) -> ChunkFactory {
    Arc::new(move |capacity| DirectChunk::of_node_alloc(platform.clone(), capacity, node))
}
