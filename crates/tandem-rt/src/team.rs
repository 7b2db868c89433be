//! The thread-team executor.
//!
//! A team is a fixed set of worker threads cooperatively executing one
//! parallel statement. The calling thread becomes rank 0 and runs the
//! original loop-body instance; ranks `1..T` run on spawned threads, each on
//! an instance produced by the body's [`split`](Loop::split) factory. Every
//! thread walks the same phase sequence: `start()` (where shared reduction
//! variables are registered), repeated work acquisition honoring the shared
//! stop flag, `finish()`, then the end-of-loop barrier. After the barrier the
//! per-thread reduction maps are folded back into the shared originals on a
//! single thread, and the first recorded failure (if any) is surfaced to the
//! caller.
//!
//! # Thread Safety
//!
//! The only cross-thread state touched without a lock is the stop flag, an
//! `AtomicBool` written monotonically; readers may observe a value one round
//! stale, which is accepted bounded staleness, not a correctness bug. Work
//! acquisition goes through the atomic cursor in `tandem-core` or the
//! serialized [`SyncIterator`]; everything else is thread-private until the
//! single-threaded reduction pass.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::Mutex;

use tandem_core::{Claimed, Schedule, ScheduleError, ScheduleRun};

use crate::error::{BodyError, PanicFailure, TeamError};
use crate::properties::ThreadCount;
use crate::reduction::{reduce_all, LocalVbl, ReductionMap};
use crate::sync_iter::SyncIterator;
use crate::vbl::{SharedVbl, Vbl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Run,
    Finish,
}

/// Per-thread view of the team handed to every loop-body hook.
pub struct LoopContext {
    rank: usize,
    threads: usize,
    stop: Arc<AtomicBool>,
    map: ReductionMap,
    phase: Phase,
}

impl LoopContext {
    fn new(rank: usize, threads: usize, stop: Arc<AtomicBool>) -> Self {
        LoopContext {
            rank,
            threads,
            stop,
            map: ReductionMap::new(),
            phase: Phase::Start,
        }
    }

    /// This thread's rank in `[0, threads)`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of threads in the team.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Requests early termination of the whole team.
    ///
    /// Every thread stops acquiring new work as soon as its current unit
    /// finishes; all threads still run their `finish()` hook and reach the
    /// end-of-loop barrier.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// True once any thread has requested early termination.
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Registers a shared reduction variable and returns the key to this
    /// thread's private clone.
    ///
    /// # Panics
    ///
    /// Panics if called outside the `start()` hook.
    pub fn thread_local<T: Vbl>(&mut self, shared: &SharedVbl<T>) -> LocalVbl<T> {
        if self.phase != Phase::Start {
            panic!("thread_local() may only be called from the start() hook");
        }
        self.map.register(shared)
    }

    /// This thread's private clone of a registered shared variable.
    pub fn local_mut<T: Vbl>(&mut self, key: &LocalVbl<T>) -> &mut T {
        self.map.get_mut(key)
    }

    fn into_map(self) -> ReductionMap {
        self.map
    }
}

/// A loop body for an index-range parallel loop.
///
/// One instance runs per team thread: rank 0 executes the original passed to
/// `exec`, every other rank executes a fresh instance obtained from
/// [`split`](Loop::split). Fields of the body are therefore thread-local by
/// construction; cross-thread accumulation goes through reduction variables
/// registered in `start()`.
pub trait Loop: Send {
    /// Produces the per-thread instance for one additional team thread.
    ///
    /// Called once per rank other than 0, before that rank starts executing.
    /// State that must not be shared belongs here, freshly constructed.
    fn split(&self) -> Self
    where
        Self: Sized;

    /// One-time per-thread initialization. Shared reduction variables are
    /// registered here via [`LoopContext::thread_local`].
    fn start(&mut self, _ctx: &mut LoopContext) -> Result<(), BodyError> {
        Ok(())
    }

    /// The loop body for one index.
    fn run(&mut self, index: i64, ctx: &mut LoopContext) -> Result<(), BodyError>;

    /// One-time per-thread finalization, executed even after an early stop.
    fn finish(&mut self, _ctx: &mut LoopContext) -> Result<(), BodyError> {
        Ok(())
    }
}

/// A loop body for a parallel loop over the elements of a collection or
/// iterator. Same lifecycle as [`Loop`], with a typed element per call
/// instead of an index.
pub trait ObjectLoop<E>: Send {
    fn split(&self) -> Self
    where
        Self: Sized;

    fn start(&mut self, _ctx: &mut LoopContext) -> Result<(), BodyError> {
        Ok(())
    }

    fn run(&mut self, element: E, ctx: &mut LoopContext) -> Result<(), BodyError>;

    fn finish(&mut self, _ctx: &mut LoopContext) -> Result<(), BodyError> {
        Ok(())
    }
}

/// Either the caller's original body (rank 0) or an owned per-thread
/// instance.
pub enum BodyRef<'a, L> {
    Borrowed(&'a mut L),
    Owned(L),
}

impl<L> BodyRef<'_, L> {
    pub fn get(&self) -> &L {
        match self {
            BodyRef::Borrowed(body) => body,
            BodyRef::Owned(body) => body,
        }
    }

    pub fn get_mut(&mut self) -> &mut L {
        match self {
            BodyRef::Borrowed(body) => body,
            BodyRef::Owned(body) => body,
        }
    }
}

/// One team thread's share of a parallel statement, phase by phase.
///
/// This is the seam between the generic team engine and the three work
/// sharing front-ends (index range, synchronized iterator, cluster worker).
/// `work()` owns the whole acquisition loop of phase three; `abort()` is
/// invoked when the thread fails or panics so the front-end can release any
/// teammates blocked on a rendezvous of its own (the cluster worker breaks
/// its round barrier there).
pub trait TeamWorker: Send {
    /// Builds this worker's counterpart for one additional rank.
    fn split(&self) -> Self
    where
        Self: Sized;

    fn start(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError>;

    fn work(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError>;

    fn finish(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError>;

    /// Called after this thread recorded a failure, before it heads for the
    /// final barrier.
    fn abort(&self) {}
}

fn drive<W: TeamWorker>(worker: &mut W, ctx: &mut LoopContext) -> Result<(), BodyError> {
    ctx.phase = Phase::Start;
    worker.start(ctx)?;
    ctx.phase = Phase::Run;
    worker.work(ctx)?;
    ctx.phase = Phase::Finish;
    worker.finish(ctx)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn record_failure(
    stop: &AtomicBool,
    failures: &Mutex<Vec<(usize, BodyError)>>,
    rank: usize,
    error: BodyError,
) {
    stop.store(true, Ordering::Relaxed);
    warn!("team thread {} failed: {}", rank, error);
    failures.lock().push((rank, error));
}

fn run_worker<W: TeamWorker>(
    worker: &mut W,
    rank: usize,
    threads: usize,
    stop: &Arc<AtomicBool>,
    failures: &Mutex<Vec<(usize, BodyError)>>,
) -> ReductionMap {
    let mut ctx = LoopContext::new(rank, threads, Arc::clone(stop));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drive(worker, &mut ctx)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            record_failure(stop, failures, rank, error);
            worker.abort();
        }
        Err(payload) => {
            let error: BodyError = Box::new(PanicFailure { message: panic_message(payload) });
            record_failure(stop, failures, rank, error);
            worker.abort();
        }
    }
    ctx.into_map()
}

/// Runs `worker` across a team of `threads` threads and blocks the calling
/// thread until the whole team has finished and the reduction pass is done.
///
/// The caller's thread is rank 0 and executes `worker` itself; ranks `1..T`
/// execute instances produced by [`TeamWorker::split`]. Joining the spawned
/// threads is the end-of-loop barrier: failures are propagated only after
/// every thread has arrived, with the first-recorded failure surfaced and the
/// rest retained as suppressed context. The reduction pass runs only if no
/// thread failed, so a failed statement never publishes partial reductions.
pub fn execute<W: TeamWorker>(
    threads: usize,
    stop: Arc<AtomicBool>,
    worker: &mut W,
) -> Result<(), TeamError> {
    if threads == 0 {
        return Err(TeamError::Config(ScheduleError::InvalidThreads(0)));
    }
    debug!("team of {} starting", threads);
    let failures: Mutex<Vec<(usize, BodyError)>> = Mutex::new(Vec::new());
    let mut maps: Vec<ReductionMap> = Vec::with_capacity(threads);

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(threads - 1);
        for rank in 1..threads {
            let mut teammate = worker.split();
            let stop = Arc::clone(&stop);
            let failures = &failures;
            handles.push(scope.spawn(move || {
                run_worker(&mut teammate, rank, threads, &stop, failures)
            }));
        }

        maps.push(run_worker(worker, 0, threads, &stop, &failures));

        for (offset, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(map) => maps.push(map),
                // run_worker catches panics itself; a join error here means
                // the catch was bypassed, so record the rank as panicked.
                Err(payload) => {
                    let error: BodyError =
                        Box::new(PanicFailure { message: panic_message(payload) });
                    record_failure(&stop, &failures, offset + 1, error);
                    maps.push(ReductionMap::new());
                }
            }
        }
    });

    let mut failures = failures.into_inner();
    if !failures.is_empty() {
        let (rank, source) = failures.remove(0);
        return Err(TeamError::Body { rank, source, suppressed: failures });
    }

    if maps.iter().any(|map| !map.is_empty()) {
        reduce_all(maps)?;
    }
    debug!("team of {} finished", threads);
    Ok(())
}

/// Builder for a parallel for loop over a half-open `i64` index range.
///
/// Created by [`parallel_for`]; `exec` blocks the calling thread until the
/// whole team completes.
#[derive(Debug, Clone)]
pub struct ParallelFor {
    lb: i64,
    ub: i64,
    threads: ThreadCount,
    schedule: Schedule,
}

/// Starts building a parallel for loop over `range`.
pub fn parallel_for(range: Range<i64>) -> ParallelFor {
    ParallelFor {
        lb: range.start,
        ub: range.end,
        threads: ThreadCount::default(),
        schedule: Schedule::default(),
    }
}

impl ParallelFor {
    /// Overrides the team size (default: one thread per core).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = ThreadCount::Fixed(threads);
        self
    }

    /// Overrides the schedule (default: fixed).
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Executes the loop body across the team.
    pub fn exec<L: Loop>(&self, body: &mut L) -> Result<(), TeamError> {
        let threads = self.threads.resolve()?;
        let run = ScheduleRun::new(&self.schedule, threads, self.lb, self.ub)?;
        debug!(
            "parallel for [{}, {}): threads={}, schedule={}",
            self.lb, self.ub, threads, self.schedule
        );
        let stop = Arc::new(AtomicBool::new(false));
        let mut worker = RangeWorker { body: BodyRef::Borrowed(body), run: &run };
        execute(threads, stop, &mut worker)
    }
}

struct RangeWorker<'a, L: Loop> {
    body: BodyRef<'a, L>,
    run: &'a ScheduleRun,
}

impl<L: Loop> TeamWorker for RangeWorker<'_, L> {
    fn split(&self) -> Self {
        RangeWorker { body: BodyRef::Owned(self.body.get().split()), run: self.run }
    }

    fn start(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.body.get_mut().start(ctx)
    }

    fn work(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        let mut claimed = Claimed::new();
        while !ctx.stopped() {
            let chunk = match self.run.next(ctx.rank(), &mut claimed) {
                Some(chunk) => chunk,
                None => break,
            };
            for index in chunk.indices() {
                if ctx.stopped() {
                    break;
                }
                self.body.get_mut().run(index, ctx)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.body.get_mut().finish(ctx)
    }
}

/// Builder for a parallel loop over the elements of an iterator or
/// collection.
///
/// Work sharing uses the [`SyncIterator`]: each thread repeatedly pulls one
/// element and processes it, so there is no schedule and no chunking.
pub struct ParallelIter<I: Iterator> {
    iter: SyncIterator<I>,
    threads: ThreadCount,
}

/// Starts building a parallel loop over the elements of `items`.
pub fn parallel_iter<I: IntoIterator>(items: I) -> ParallelIter<I::IntoIter> {
    ParallelIter {
        iter: SyncIterator::new(items.into_iter()),
        threads: ThreadCount::default(),
    }
}

impl<I> ParallelIter<I>
where
    I: Iterator + Send,
{
    /// Overrides the team size (default: one thread per core).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = ThreadCount::Fixed(threads);
        self
    }

    /// Executes the loop body across the team, one element per call.
    ///
    /// Consumes the builder: the run drains the wrapped iterator, so there is
    /// nothing left for a second execution.
    pub fn exec<L: ObjectLoop<I::Item>>(self, body: &mut L) -> Result<(), TeamError> {
        let threads = self.threads.resolve()?;
        debug!("parallel iter: threads={}", threads);
        let stop = Arc::new(AtomicBool::new(false));
        let mut worker = IterWorker { body: BodyRef::Borrowed(body), iter: &self.iter };
        execute(threads, stop, &mut worker)
    }
}

struct IterWorker<'a, I: Iterator, L: ObjectLoop<I::Item>> {
    body: BodyRef<'a, L>,
    iter: &'a SyncIterator<I>,
}

impl<I, L> TeamWorker for IterWorker<'_, I, L>
where
    I: Iterator + Send,
    L: ObjectLoop<I::Item>,
{
    fn split(&self) -> Self {
        IterWorker { body: BodyRef::Owned(self.body.get().split()), iter: self.iter }
    }

    fn start(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.body.get_mut().start(ctx)
    }

    fn work(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        while !ctx.stopped() {
            match self.iter.next() {
                Some(element) => self.body.get_mut().run(element, ctx)?,
                None => break,
            }
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.body.get_mut().finish(ctx)
    }
}
