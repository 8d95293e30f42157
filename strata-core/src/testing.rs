//! Test double for the platform capability provider.
//!
//! Backs "node-scoped" allocations with ordinary heap memory while
//! recording which node each block was requested on, so affinity
//! verification and pinning behavior can be exercised on any machine.
//! Pinning is simulated with a thread-local "current node" that the
//! mock moves instantly, or never moves at all when configured to
//! misbehave, which is how the retry-exhaustion path gets covered.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use strata_io::{check_node, Platform, PlatformError};

thread_local! {
    /// Node the calling thread pretends to run on.
    static THREAD_NODE: Cell<usize> = const { Cell::new(0) };
}

const MOCK_ALIGN: usize = 4096;

struct Allocation {
    size: usize,
    node: usize,
}

pub struct MockPlatform {
    node_count: usize,
    processor_count: usize,
    honor_pinning: bool,
    allocations: Mutex<HashMap<usize, Allocation>>,
    /// Every node ever passed to pin_current_thread.
    pin_attempts: Mutex<Vec<usize>>,
}

pub struct MockPlatformBuilder {
    node_count: usize,
    processor_count: usize,
    honor_pinning: bool,
}

impl MockPlatformBuilder {
    pub fn honor_pinning(mut self, honor: bool) -> Self {
        self.honor_pinning = honor;
        self
    }

    pub fn shared(self) -> Arc<MockPlatform> {
        Arc::new(MockPlatform {
            node_count: self.node_count,
            processor_count: self.processor_count,
            honor_pinning: self.honor_pinning,
            allocations: Mutex::new(HashMap::new()),
            pin_attempts: Mutex::new(Vec::new()),
        })
    }
}

impl MockPlatform {
    pub fn builder(node_count: usize, processor_count: usize) -> MockPlatformBuilder {
        MockPlatformBuilder {
            node_count,
            processor_count,
            honor_pinning: true,
        }
    }

    pub fn shared(node_count: usize, processor_count: usize) -> Arc<Self> {
        Self::builder(node_count, processor_count).shared()
    }

    /// Number of blocks allocated and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    /// How many times a pin onto `node` was requested.
    pub fn pin_attempts_for(&self, node: usize) -> usize {
        self.pin_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|&&n| n == node)
            .count()
    }

    fn allocate(&self, size: usize, node: usize) -> Result<usize, PlatformError> {
        let layout = Layout::from_size_align(size.max(1), MOCK_ALIGN).map_err(|_| {
            PlatformError::AllocationFailed {
                size,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            }
        })?;
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(PlatformError::AllocationFailed {
                size,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            });
        }
        let addr = ptr as usize;
        self.allocations
            .lock()
            .unwrap()
            .insert(addr, Allocation { size, node });
        Ok(addr)
    }

    fn free(&self, addr: usize) {
        let Some(allocation) = self.allocations.lock().unwrap().remove(&addr) else {
            return; // released through the one-shot guard already
        };
        let layout = Layout::from_size_align(allocation.size.max(1), MOCK_ALIGN)
            .expect("layout was valid at allocation time");
        // SAFETY: addr was produced by alloc_zeroed with this layout.
        unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
    }
}

impl Platform for MockPlatform {
    fn node_count(&self) -> usize {
        self.node_count
    }

    fn current_node(&self) -> usize {
        THREAD_NODE.with(Cell::get)
    }

    fn numa_available(&self) -> bool {
        self.node_count > 1
    }

    fn node_of_address(&self, addr: usize) -> Result<usize, PlatformError> {
        let allocations = self.allocations.lock().unwrap();
        let node = allocations
            .iter()
            .find(|(&base, a)| addr >= base && addr < base + a.size)
            .map(|(_, a)| a.node)
            .unwrap_or(0);
        Ok(node)
    }

    fn map_anonymous(&self, size: usize) -> Result<usize, PlatformError> {
        // First-touch placement approximated by the caller's node.
        self.allocate(size, self.current_node())
    }

    fn unmap(&self, addr: usize, _size: usize) {
        self.free(addr);
    }

    fn allocate_on_node(&self, size: usize, node: usize) -> Result<usize, PlatformError> {
        check_node(self, node)?;
        self.allocate(size, node)
    }

    fn free_on_node(&self, addr: usize, _size: usize) {
        self.free(addr);
    }

    fn pin_current_thread(&self, node: usize) {
        self.pin_attempts.lock().unwrap().push(node);
        if self.honor_pinning && node < self.node_count {
            THREAD_NODE.with(|n| n.set(node));
        }
    }

    fn processor_count(&self) -> usize {
        self.processor_count
    }

    fn node_of_processor(&self, cpu: usize) -> usize {
        let per_node = (self.processor_count / self.node_count).max(1);
        (cpu / per_node).min(self.node_count - 1)
    }
}
