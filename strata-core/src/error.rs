use strata_io::PlatformError;
use thiserror::Error;

/// Failures raised by columns, schedulers and parallel passes.
///
/// Platform errors (allocation failure, unsupported placement, invalid
/// node) propagate unchanged; everything else is specific to this
/// crate.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("position {position} out of bounds for capacity {capacity}")]
    OutOfBounds { position: usize, capacity: usize },

    /// Post-hoc placement check failed. The histogram maps node id to
    /// the number of chunks resolved on that node and always sums to
    /// the total chunk count.
    #[error("wrong chunk placement: expected node {expected}, distribution {histogram:?}")]
    AffinityViolation {
        expected: usize,
        histogram: Vec<usize>,
    },

    /// One or more tasks of a parallel pass failed. The surviving
    /// tasks still ran to completion; this aggregate is raised only
    /// after the join.
    #[error("{}/{submitted} parallel task(s) failed: [{}]", failures.len(), failures.join("; "))]
    TaskFailed {
        submitted: usize,
        failures: Vec<String>,
    },

    #[error("failed to spawn a carrier worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
