//! The coordinator-facing chunk source interface.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use tandem_core::{Chunk, ScheduleError};

use crate::error::SourceError;

/// The request template a worker sends with every chunk pull, carrying the
/// worker process's cluster-wide rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTemplate {
    rank: usize,
}

impl ChunkTemplate {
    pub fn new(rank: usize) -> Self {
        ChunkTemplate { rank }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// A worker's channel to the chunk coordinator.
///
/// `try_take` is the non-blocking "take a chunk tuple matching this worker's
/// template" operation: a chunk handed to one caller is never handed to
/// another, and `None` means the distributed iteration space holds nothing
/// further for this worker. The transport behind it (tuple store, message
/// queue, ...) is outside this crate; implementations only promise the
/// at-most-once semantics.
pub trait ChunkSource: Send + Sync {
    /// Takes the next chunk for this worker, or `None` once the space is
    /// exhausted. Errors are fatal for the worker: there is no silent retry.
    fn try_take(&self, template: &ChunkTemplate) -> Result<Option<Chunk>, SourceError>;

    /// This worker process's cluster-wide rank.
    fn task_rank(&self) -> usize;
}

impl<S: ChunkSource + ?Sized> ChunkSource for Arc<S> {
    fn try_take(&self, template: &ChunkTemplate) -> Result<Option<Chunk>, SourceError> {
        (**self).try_take(template)
    }

    fn task_rank(&self) -> usize {
        (**self).task_rank()
    }
}

/// An in-process chunk source backed by a shared queue of pre-cut chunks.
///
/// Stands in for a remote coordinator when several workers run in one
/// process: all workers drain the same queue first-come-first-served, which
/// is exactly the allocation order a central coordinator would impose.
pub struct QueueChunkSource {
    rank: usize,
    queue: Arc<Mutex<VecDeque<Chunk>>>,
}

impl QueueChunkSource {
    /// Creates the source for the worker with the given rank, drawing from
    /// `queue`.
    pub fn new(rank: usize, queue: Arc<Mutex<VecDeque<Chunk>>>) -> Self {
        QueueChunkSource { rank, queue }
    }

    /// Cuts `[lb, ub)` into unit-stride chunks of `chunk_size` indices (the
    /// last one may be shorter) and returns the shared queue holding them.
    pub fn cut(
        lb: i64,
        ub: i64,
        chunk_size: i64,
    ) -> Result<Arc<Mutex<VecDeque<Chunk>>>, ScheduleError> {
        if lb > ub {
            return Err(ScheduleError::InvalidRange { lb, ub });
        }
        if chunk_size < 1 {
            return Err(ScheduleError::InvalidChunk(chunk_size));
        }
        let mut queue = VecDeque::new();
        let mut at = lb;
        while at < ub {
            let end = at.saturating_add(chunk_size).min(ub);
            queue.push_back(Chunk::contiguous(at, end, 0)?);
            at = end;
        }
        Ok(Arc::new(Mutex::new(queue)))
    }
}

impl ChunkSource for QueueChunkSource {
    fn try_take(&self, template: &ChunkTemplate) -> Result<Option<Chunk>, SourceError> {
        Ok(self
            .queue
            .lock()
            .pop_front()
            .map(|chunk| chunk.with_rank(template.rank())))
    }

    fn task_rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_tiles_the_range() {
        let queue = QueueChunkSource::cut(0, 25, 10).unwrap();
        let chunks: Vec<_> = queue.lock().iter().map(|c| (c.lb(), c.ub())).collect();
        assert_eq!(chunks, vec![(0, 10), (10, 20), (20, 25)]);
    }

    #[test]
    fn cut_rejects_bad_parameters() {
        assert!(matches!(
            QueueChunkSource::cut(5, 0, 10),
            Err(ScheduleError::InvalidRange { lb: 5, ub: 0 })
        ));
        assert!(matches!(
            QueueChunkSource::cut(0, 10, 0),
            Err(ScheduleError::InvalidChunk(0))
        ));
    }

    #[test]
    fn chunks_are_handed_out_at_most_once() {
        let queue = QueueChunkSource::cut(0, 20, 10).unwrap();
        let a = QueueChunkSource::new(0, queue.clone());
        let b = QueueChunkSource::new(1, queue);
        let template_a = ChunkTemplate::new(a.task_rank());
        let template_b = ChunkTemplate::new(b.task_rank());
        let first = a.try_take(&template_a).unwrap().unwrap();
        let second = b.try_take(&template_b).unwrap().unwrap();
        assert_ne!((first.lb(), first.ub()), (second.lb(), second.ub()));
        assert_eq!(first.rank(), 0);
        assert_eq!(second.rank(), 1);
        assert!(a.try_take(&template_a).unwrap().is_none());
    }
}
