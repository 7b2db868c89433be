//! Serialized iterator shared by the threads of a team.

use parking_lot::Mutex;

/// Wraps an iterator behind a single atomic "next element or exhaustion"
/// operation.
///
/// Multiple team threads call [`next`](SyncIterator::next) concurrently; each
/// call is serialized internally, so exactly one thread receives each element
/// and every call after exhaustion observes `None`. This is the work-sharing
/// mode for loops over collections: no chunking, no schedule, no stride.
pub struct SyncIterator<I: Iterator> {
    inner: Mutex<I>,
}

impl<I: Iterator> SyncIterator<I> {
    pub fn new(iter: I) -> Self {
        SyncIterator { inner: Mutex::new(iter) }
    }

    /// Takes the next element, or `None` once the underlying iterator is
    /// exhausted.
    pub fn next(&self) -> Option<I::Item> {
        self.inner.lock().next()
    }
}
