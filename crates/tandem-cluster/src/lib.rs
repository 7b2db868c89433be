//! Tandem-Cluster: the worker side of master-worker parallel loops
//!
//! One logical parallel loop can span many worker processes. Each worker
//! repeatedly pulls a range of loop indices from a central coordinator
//! through the [`ChunkSource`] interface, subdivides the range among its own
//! thread team with the full `tandem-rt` machinery (schedules, reduction
//! variables, stop flag), reports nothing back until its share is complete,
//! and stops once the coordinator has no chunk left for it. Load balancing is
//! driven centrally by the coordinator's first-come-first-served allocation
//! and locally by each worker's own schedule.
//!
//! The coordinator itself (tuple store, tracker process, transport) is an
//! external collaborator: this crate only defines the pull interface and the
//! worker-side state machine. [`QueueChunkSource`] provides an in-process
//! stand-in for running several workers inside one process.

mod error;
mod source;
mod worker;

pub use error::{SourceError, WorkerError};
pub use source::{ChunkSource, ChunkTemplate, QueueChunkSource};
pub use worker::WorkerParallelFor;
