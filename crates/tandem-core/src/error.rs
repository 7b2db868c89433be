use thiserror::Error;

/// Configuration errors detected when a schedule or chunk is constructed.
///
/// These are never silently corrected; they are reported synchronously to the
/// invoking thread before any worker thread starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid thread count {0}; a team needs at least one thread")]
    InvalidThreads(usize),

    #[error("invalid chunk size {0}; chunk sizes must be >= 0")]
    InvalidChunk(i64),

    #[error("invalid index range: lower bound {lb} exceeds upper bound {ub}")]
    InvalidRange { lb: i64, ub: i64 },

    #[error("invalid stride {0}; strides must be >= 1")]
    InvalidStride(i64),

    #[error("proportional schedule requires a non-empty weight list")]
    EmptyWeights,

    #[error("proportional schedule has {got} weights but the team has {expected} threads")]
    WeightCount { expected: usize, got: usize },

    #[error("proportional schedule weights sum to zero")]
    ZeroWeights,
}
