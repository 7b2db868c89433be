//! Per-thread registry binding shared reduction variables to their private
//! clones.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ShapeError;
use crate::vbl::{DynVbl, SharedVbl, Vbl};

/// Type-erased handle back to the shared original of a registered variable.
///
/// Identity (which shared variable an entry belongs to) is the address of the
/// shared cell, so clones of the same [`SharedVbl`] handle fold together.
pub(crate) trait SharedCell: Send + Sync {
    fn addr(&self) -> usize;
    fn set_from(&self, acc: &dyn DynVbl) -> Result<(), ShapeError>;
}

struct CellHandle<T: Vbl> {
    cell: Arc<Mutex<T>>,
}

impl<T: Vbl> SharedCell for CellHandle<T> {
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }

    fn set_from(&self, acc: &dyn DynVbl) -> Result<(), ShapeError> {
        let src = acc.as_any().downcast_ref::<T>().ok_or(ShapeError::Type)?;
        self.cell.lock().set(src);
        Ok(())
    }
}

/// Typed key to a thread's private clone of a shared variable.
///
/// Returned by `thread_local()` during the `start()` hook; passed to
/// `local_mut()` from the per-unit callback to mutate the private clone. Keys
/// are only meaningful for the reduction map that issued them.
pub struct LocalVbl<T: Vbl> {
    slot: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Vbl> Clone for LocalVbl<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Vbl> Copy for LocalVbl<T> {}

pub(crate) struct Entry {
    cell: Arc<dyn SharedCell>,
    private: Box<dyn DynVbl>,
}

/// One team thread's registry of shared-variable to private-clone bindings.
///
/// Created fresh for every team invocation. During the loop only the owning
/// thread touches it; after the end-of-loop barrier the maps of all ranks are
/// folded by [`reduce_all`] on a single thread.
#[derive(Default)]
pub struct ReductionMap {
    entries: Vec<Entry>,
}

impl ReductionMap {
    pub(crate) fn new() -> Self {
        ReductionMap { entries: Vec::new() }
    }

    /// Registers `shared` and clones its current value into this thread's
    /// private copy. Registering the same shared variable twice returns the
    /// existing key.
    pub(crate) fn register<T: Vbl>(&mut self, shared: &SharedVbl<T>) -> LocalVbl<T> {
        let addr = Arc::as_ptr(&shared.cell) as usize;
        if let Some(slot) = self.entries.iter().position(|e| e.cell.addr() == addr) {
            return LocalVbl { slot, _marker: PhantomData };
        }
        let private: T = shared.cell.lock().clone_vbl();
        self.entries.push(Entry {
            cell: Arc::new(CellHandle { cell: shared.cell.clone() }),
            private: Box::new(private),
        });
        LocalVbl { slot: self.entries.len() - 1, _marker: PhantomData }
    }

    /// The private clone behind `key`.
    pub(crate) fn get_mut<T: Vbl>(&mut self, key: &LocalVbl<T>) -> &mut T {
        let entry = match self.entries.get_mut(key.slot) {
            Some(entry) => entry,
            None => panic!("thread-local key used with a reduction map that did not issue it"),
        };
        match entry.private.as_any_mut().downcast_mut::<T>() {
            Some(private) => private,
            None => panic!("thread-local key used with a reduction map that did not issue it"),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Folds the per-thread maps back into the shared originals.
///
/// `maps` must be in ascending rank order; for every shared variable the
/// rank-lowest private clone is the accumulator, the remaining clones are
/// reduced into it in rank order, and the result is written to the original
/// with `set`. Runs on one thread after every team thread has passed the
/// barrier, so no locking is needed beyond the final `set`.
pub(crate) fn reduce_all(maps: Vec<ReductionMap>) -> Result<(), ShapeError> {
    struct Group {
        cell: Arc<dyn SharedCell>,
        acc: Box<dyn DynVbl>,
    }

    let mut groups: Vec<Group> = Vec::new();
    for map in maps {
        for entry in map.entries {
            match groups.iter_mut().find(|g| g.cell.addr() == entry.cell.addr()) {
                Some(group) => group.acc.reduce_dyn(&*entry.private)?,
                None => groups.push(Group { cell: entry.cell, acc: entry.private }),
            }
        }
    }
    for group in groups {
        group.cell.set_from(&*group.acc)?;
    }
    Ok(())
}
