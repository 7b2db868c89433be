use thiserror::Error;

use tandem_rt::TeamError;

/// Failure of a coordinator chunk request.
///
/// The worker does not retry: a pull that fails is fatal for this worker
/// process and surfaces to the enclosing job as a
/// [`WorkerError::Coordination`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("coordinator request failed: {message}")]
pub struct SourceError {
    message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        SourceError { message: message.into() }
    }
}

/// Errors surfaced by [`exec`](crate::WorkerParallelFor::exec) on the
/// invoking thread of a worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A local team failure: configuration, loop body, or reduction.
    #[error(transparent)]
    Team(#[from] TeamError),

    /// The coordinator could not be reached for a chunk pull.
    #[error("coordinator unreachable: {0}")]
    Coordination(#[source] SourceError),
}
