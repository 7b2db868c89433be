use thiserror::Error;

use tandem_core::ScheduleError;

/// Error type loop-body hooks report failures with.
///
/// Bodies may surface any error type; the team boxes it, records it against
/// the failing rank and re-throws the first one to the caller once every
/// thread has reached the end-of-loop barrier.
pub type BodyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structural mismatch between two reduction variables.
///
/// Reducing two variables of different shape (for example two bit sets of
/// different word counts) is a configuration error and is reported, never
/// silently ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("mismatched reduction shapes: expected {expected} words, got {got}")]
    Words { expected: usize, got: usize },

    #[error("mismatched reduction shapes: expected {expected} bins, got {got}")]
    Bins { expected: usize, got: usize },

    #[error("mismatched reduction variable types")]
    Type,
}

/// Errors surfaced by [`exec`](crate::ParallelFor::exec) on the invoking
/// thread.
#[derive(Error, Debug)]
pub enum TeamError {
    /// Invalid thread count, chunk size or range, rejected before any worker
    /// thread starts.
    #[error(transparent)]
    Config(#[from] ScheduleError),

    /// The post-barrier reduction pass hit mismatched variable shapes.
    #[error("reduction failed: {0}")]
    Reduction(#[from] ShapeError),

    /// A loop-body hook failed (or a worker thread panicked) on the given
    /// rank. `suppressed` retains the failures of any other ranks from the
    /// same invocation, in completion order.
    #[error("loop body failed on team thread {rank}: {source}")]
    Body {
        rank: usize,
        #[source]
        source: BodyError,
        suppressed: Vec<(usize, BodyError)>,
    },
}

/// Failure recorded when a worker thread panics instead of returning an
/// error.
#[derive(Error, Debug)]
#[error("team thread panicked: {message}")]
pub struct PanicFailure {
    pub message: String,
}
