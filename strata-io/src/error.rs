use thiserror::Error;

/// Failures surfaced by the platform capability provider.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("platform could not satisfy a request for {size} bytes: {source}")]
    AllocationFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("node-scoped allocation is not supported on this platform")]
    UnsupportedPlacement,

    #[error("invalid NUMA node {node}, must be in range [0, {available})")]
    InvalidNode { node: usize, available: usize },

    #[error("failed to resolve the NUMA node of address {addr:#x}: {source}")]
    AddressResolution {
        addr: usize,
        #[source]
        source: std::io::Error,
    },
}

impl PlatformError {
    /// True when the error indicates the platform ran out of memory,
    /// as opposed to a misuse of the API.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, PlatformError::AllocationFailed { .. })
    }
}
