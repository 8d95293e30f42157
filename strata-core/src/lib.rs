//! Strata core: NUMA-locality storage and execution.
//!
//! Three tightly coupled pieces:
//!
//! - [`chunk`] / [`column`]: off-heap, node-aware chunked storage for
//!   `f64` columns, with post-hoc placement verification.
//! - [`sched`]: node-pinned carrier worker pools, one per NUMA node,
//!   with best-effort re-pinning when the OS migrates a carrier.
//! - [`access`]: the fan-out/fan-in protocol that runs one task per
//!   chunk and waits for the whole pass.
//!
//! Placement ("allocate on node K") and verification ("prove the
//! memory is on node K") are deliberately independent: choosing "no
//! preference" never silently skips the check.

pub mod access;
pub mod chunk;
pub mod column;
pub mod error;
pub mod sched;

#[cfg(test)]
pub(crate) mod testing;

pub use access::{generate, read_pass, split_rows};
pub use chunk::{mmap_factory, node_alloc_factory, ChunkFactory, DirectChunk, ELEMENT_SIZE};
pub use column::Column;
pub use error::AccessError;
pub use sched::{registry, NodeScheduler, SchedulerRegistry};
