//! Strata I/O: the platform capability layer.
//!
//! Everything NUMA-specific about the host lives behind the
//! [`Platform`] trait: topology, node-scoped raw memory, placement
//! queries and best-effort thread pinning. The rest of the workspace
//! only ever talks to this trait, which is what lets the core run
//! (and be tested) on single-node machines.

pub mod error;
pub mod platform;
pub mod topology;

pub use error::PlatformError;
pub use platform::{check_node, current, processors_per_node, FallbackPlatform, Platform};
pub use topology::NodeTopology;

#[cfg(target_os = "linux")]
pub use platform::linux::LinuxPlatform;
