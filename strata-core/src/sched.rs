//! Node-pinned carrier worker pools.
//!
//! One scheduler per NUMA node, built lazily and cached for the
//! process lifetime. Each scheduler owns a small pool of OS threads
//! (the carriers) onto which many lightweight tasks are multiplexed.
//! Carriers ask the OS to run them on the scheduler's node, then poll
//! their actual node with bounded exponential backoff; pinning is
//! advisory, so exhausting the retries only logs a warning. Because
//! the OS may migrate a carrier later, carriers repeat the pinning
//! step periodically.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::{Lazy, OnceCell};
use strata_io::{check_node, Platform, PlatformError};

use crate::error::AccessError;

/// Bounded pin-retry attempts, with delays doubling from 1 ms.
const MAX_PIN_ATTEMPTS: u32 = 5;

/// Tasks executed between affinity re-checks on a carrier.
const REPIN_INTERVAL: usize = 64;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A pool of carrier workers, optionally pinned to one NUMA node.
///
/// `node == None` is the generic unpinned pool used when the caller
/// has no placement preference.
pub struct NodeScheduler {
    node: Option<usize>,
    pool_size: usize,
    sender: Sender<Task>,
}

impl NodeScheduler {
    /// Builds the pool and starts its carriers. The default pool size
    /// is the number of logical processors on the target node (or on
    /// the whole machine for the unpinned pool), overridable with
    /// `pool_size`.
    pub fn new(
        platform: Arc<dyn Platform>,
        node: Option<usize>,
        pool_size: Option<usize>,
    ) -> Result<Self, AccessError> {
        if let Some(node) = node {
            check_node(platform.as_ref(), node)?;
        }

        let default_size = match node {
            Some(node) => strata_io::processors_per_node(platform.as_ref())[node],
            None => platform.processor_count(),
        };
        let pool_size = pool_size.unwrap_or(default_size).max(1);

        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..pool_size {
            let name = match node {
                Some(node) => format!("strata-node{node}-{worker}"),
                None => format!("strata-any-{worker}"),
            };
            let platform = Arc::clone(&platform);
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(name)
                .spawn(move || carrier_main(platform, node, &receiver))?;
        }

        Ok(Self {
            node,
            pool_size,
            sender,
        })
    }

    /// Target node, `None` for the unpinned pool.
    pub fn node(&self) -> Option<usize> {
        self.node
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Queues a lightweight task onto the pool. Tasks carry no node
    /// affinity of their own; they inherit this scheduler's node.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        // The receiver lives inside the carriers, which never exit
        // while the scheduler exists, so a send failure is unreachable.
        if self.sender.send(Box::new(task)).is_err() {
            warn!("task submitted to a scheduler with no live carriers, dropping it");
        }
    }
}

/// Carrier loop: pin, then drain tasks until the channel closes.
fn carrier_main(platform: Arc<dyn Platform>, node: Option<usize>, receiver: &Mutex<Receiver<Task>>) {
    if let Some(node) = node {
        pin_with_backoff(platform.as_ref(), node);
    }

    let mut executed: usize = 0;
    loop {
        // Take the next task while holding the lock, run it without.
        let task = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        let Ok(task) = task else {
            return; // all senders gone
        };

        // A panicking task must not take its carrier down with it.
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!(
                "task panicked on carrier {:?}",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }

        executed += 1;
        if let Some(node) = node {
            if executed % REPIN_INTERVAL == 0 && platform.current_node() != node {
                debug!("carrier drifted off node {node}, re-pinning");
                pin_with_backoff(platform.as_ref(), node);
            }
        }
    }
}

/// Requests the migration, then polls the actual node with doubling
/// delays. Best effort: on exhaustion the carrier keeps running where
/// the OS put it.
fn pin_with_backoff(platform: &dyn Platform, node: usize) {
    platform.pin_current_thread(node);

    for attempt in 0..MAX_PIN_ATTEMPTS {
        if platform.current_node() == node {
            return;
        }
        debug!("waiting for reschedule onto node {node}, attempt #{attempt}");
        thread::sleep(Duration::from_millis(1 << attempt));
    }

    if platform.current_node() != node {
        warn!(
            "carrier {:?} failed to move to node {node}, continuing unpinned",
            thread::current().name().unwrap_or("<unnamed>")
        );
    }
}

/// Process-wide scheduler cache: at most one scheduler per node, built
/// on first use and shared until process exit. There is no teardown.
pub struct SchedulerRegistry {
    platform: Arc<dyn Platform>,
    pinned: Vec<OnceCell<Arc<NodeScheduler>>>,
    unpinned: OnceCell<Arc<NodeScheduler>>,
}

impl SchedulerRegistry {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        let node_count = platform.node_count();
        Self {
            platform,
            pinned: (0..node_count).map(|_| OnceCell::new()).collect(),
            unpinned: OnceCell::new(),
        }
    }

    /// The scheduler pinned to `node`, building it on first use. Safe
    /// under concurrent first use; exactly one pool is ever built per
    /// node.
    pub fn scheduler_for(&self, node: usize) -> Result<Arc<NodeScheduler>, AccessError> {
        let cell = self
            .pinned
            .get(node)
            .ok_or(PlatformError::InvalidNode {
                node,
                available: self.pinned.len(),
            })?;
        let scheduler = cell.get_or_try_init(|| {
            NodeScheduler::new(Arc::clone(&self.platform), Some(node), None).map(Arc::new)
        })?;
        Ok(Arc::clone(scheduler))
    }

    /// The generic unpinned pool, for callers without a node
    /// preference.
    pub fn unpinned(&self) -> Result<Arc<NodeScheduler>, AccessError> {
        let scheduler = self.unpinned.get_or_try_init(|| {
            NodeScheduler::new(Arc::clone(&self.platform), None, None).map(Arc::new)
        })?;
        Ok(Arc::clone(scheduler))
    }

    /// Scheduler for an optional node preference.
    pub fn scheduler(&self, node: Option<usize>) -> Result<Arc<NodeScheduler>, AccessError> {
        match node {
            Some(node) => self.scheduler_for(node),
            None => self.unpinned(),
        }
    }
}

static GLOBAL: Lazy<SchedulerRegistry> = Lazy::new(|| SchedulerRegistry::new(strata_io::current()));

/// The registry bound to the process platform.
pub fn registry() -> &'static SchedulerRegistry {
    &GLOBAL
}
