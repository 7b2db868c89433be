//! Cyclic team barrier with a leader-run round action.

use parking_lot::{Condvar, Mutex};

/// Outcome of one [`Barrier::wait_with`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// This thread was the last to arrive and ran the round action.
    Leader,
    /// Another thread ran the round action.
    Member,
    /// The barrier was broken; the round action did not run for this arrival
    /// and no further rounds will run.
    Broken,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

/// A reusable barrier for a fixed-size team of threads.
///
/// The last thread to arrive in each round is the leader: it runs the round
/// action while every other thread is still blocked, then releases them, so
/// all threads observe the action's effects before resuming. The cluster
/// worker uses this to issue exactly one coordinator request per round.
///
/// A failing thread that can no longer arrive must call
/// [`break_barrier`](Barrier::break_barrier); waiters are released with
/// [`BarrierWait::Broken`] and the barrier stays broken, which guarantees no
/// thread is ever left blocked behind a dead teammate.
pub struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl Barrier {
    /// Creates a barrier for `parties` threads.
    ///
    /// # Panics
    ///
    /// Panics if `parties` is zero.
    pub fn new(parties: usize) -> Self {
        if parties == 0 {
            panic!("a barrier needs at least one party");
        }
        Barrier {
            parties,
            state: Mutex::new(BarrierState { arrived: 0, generation: 0, broken: false }),
            cvar: Condvar::new(),
        }
    }

    /// Arrives at the barrier and blocks until all parties have arrived.
    pub fn wait(&self) -> BarrierWait {
        self.wait_with(|| ())
    }

    /// Arrives at the barrier; the last arriver runs `action` before any
    /// thread is released.
    pub fn wait_with<F: FnOnce()>(&self, action: F) -> BarrierWait {
        let mut state = self.state.lock();
        if state.broken {
            return BarrierWait::Broken;
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            action();
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return BarrierWait::Leader;
        }
        let generation = state.generation;
        while state.generation == generation && !state.broken {
            self.cvar.wait(&mut state);
        }
        if state.broken {
            BarrierWait::Broken
        } else {
            BarrierWait::Member
        }
    }

    /// Breaks the barrier, releasing all current and future waiters with
    /// [`BarrierWait::Broken`]. Idempotent.
    pub fn break_barrier(&self) {
        let mut state = self.state.lock();
        state.broken = true;
        self.cvar.notify_all();
    }

    /// True once the barrier has been broken.
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn one_leader_per_round() {
        let barrier = Barrier::new(4);
        let leaders = AtomicUsize::new(0);
        let actions = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        if barrier.wait_with(|| {
                            actions.fetch_add(1, Ordering::Relaxed);
                        }) == BarrierWait::Leader
                        {
                            leaders.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(leaders.load(Ordering::Relaxed), 10);
        assert_eq!(actions.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn breaking_releases_waiters() {
        let barrier = Barrier::new(2);
        thread::scope(|scope| {
            let waiter = scope.spawn(|| barrier.wait());
            // Give the waiter a moment to block, then break instead of
            // arriving.
            thread::sleep(std::time::Duration::from_millis(20));
            barrier.break_barrier();
            assert_eq!(waiter.join().unwrap(), BarrierWait::Broken);
        });
        assert_eq!(barrier.wait(), BarrierWait::Broken);
    }
}
