//! The worker side of the master-worker cluster parallel for loop.
//!
//! A worker process does not own the iteration space: it repeatedly pulls a
//! chunk of loop indices from the coordinator and subdivides it among its own
//! team threads, until the coordinator reports that nothing is left. Per
//! round, all team threads rendezvous at a barrier and exactly one of them
//! (the last arriver) issues the pull, so one coordinator request goes out
//! per round regardless of team size, and every thread observes the same
//! chunk (or its absence) before resuming.
//!
//! State machine per worker, with all threads moving together:
//!
//! - awaiting chunk: barrier rendezvous, leader pulls
//! - running team: unit-stride chunks are subdivided by the worker's own
//!   schedule, strided chunks follow the fixed leapfrog rule
//! - done: no chunk was returned (or the team stopped); every thread runs its
//!   `finish()` hook and the usual reduction and failure propagation apply

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use tandem_core::{Chunk, Claimed, Schedule, ScheduleRun};
use tandem_rt::{
    execute, Barrier, BarrierWait, BodyError, BodyRef, Loop, LoopContext, TeamError, TeamWorker,
    ThreadCount,
};

use crate::error::{SourceError, WorkerError};
use crate::source::{ChunkSource, ChunkTemplate};

/// Builder for the worker portion of a cluster-wide parallel for loop.
///
/// `exec` blocks the calling thread until this worker's share of the
/// distributed loop is complete, that is, until the coordinator has no chunk
/// left to give it.
pub struct WorkerParallelFor<S: ChunkSource> {
    source: Arc<S>,
    threads: ThreadCount,
    schedule: Schedule,
}

impl<S: ChunkSource> WorkerParallelFor<S> {
    pub fn new(source: Arc<S>) -> Self {
        WorkerParallelFor {
            source,
            threads: ThreadCount::default(),
            schedule: Schedule::default(),
        }
    }

    /// Overrides the team size (default: one thread per core).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = ThreadCount::Fixed(threads);
        self
    }

    /// Overrides the schedule used to subdivide each master chunk among this
    /// worker's threads (default: fixed).
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Executes the loop body across this worker's team, pulling chunks from
    /// the coordinator until the space is exhausted.
    pub fn exec<L: Loop>(&self, body: &mut L) -> Result<(), WorkerError> {
        let threads = self.threads.resolve().map_err(TeamError::from)?;
        self.schedule.validate(threads).map_err(TeamError::from)?;
        let stop = Arc::new(AtomicBool::new(false));
        let rank = self.source.task_rank();
        debug!(
            "cluster worker {} starting: threads={}, schedule={}",
            rank, threads, self.schedule
        );
        let shared = Arc::new(RoundShared {
            barrier: Barrier::new(threads),
            round: Mutex::new(Round { chunk: None, run: None, number: 0 }),
            pull_error: Mutex::new(None),
            source: Arc::clone(&self.source),
            template: ChunkTemplate::new(rank),
            schedule: self.schedule.clone(),
            threads,
            stop: Arc::clone(&stop),
        });
        let mut worker = ClusterWorker { body: BodyRef::Borrowed(body), shared };
        match execute(threads, stop, &mut worker) {
            Ok(()) => {
                debug!("cluster worker {} done", rank);
                Ok(())
            }
            Err(TeamError::Body { rank, source, suppressed }) => {
                // A failed chunk pull travels through the team as a body
                // failure; unwrap it back into a coordination failure.
                match source.downcast::<SourceError>() {
                    Ok(pull) => Err(WorkerError::Coordination(*pull)),
                    Err(source) => {
                        Err(WorkerError::Team(TeamError::Body { rank, source, suppressed }))
                    }
                }
            }
            Err(other) => Err(WorkerError::Team(other)),
        }
    }
}

/// The chunk (and its local subdivision state) of the current round.
struct Round {
    chunk: Option<Chunk>,
    /// Local schedule over the chunk's range; `None` for strided chunks,
    /// which use the leapfrog rule instead.
    run: Option<Arc<ScheduleRun>>,
    number: u64,
}

struct RoundShared<S: ChunkSource> {
    barrier: Barrier,
    round: Mutex<Round>,
    pull_error: Mutex<Option<SourceError>>,
    source: Arc<S>,
    template: ChunkTemplate,
    schedule: Schedule,
    threads: usize,
    stop: Arc<AtomicBool>,
}

impl<S: ChunkSource> RoundShared<S> {
    /// The per-round coordinator pull, run by the barrier leader while every
    /// other thread is still blocked.
    fn pull_round(&self) {
        let mut round = self.round.lock();
        round.chunk = None;
        round.run = None;
        round.number += 1;
        if self.stop.load(Ordering::Relaxed) {
            // An early stop ends the distributed loop for this worker; any
            // chunks still at the coordinator go to other workers.
            return;
        }
        match self.source.try_take(&self.template) {
            Ok(Some(chunk)) => {
                debug!(
                    "worker {} round {}: chunk [{}, {}) stride {}",
                    self.template.rank(),
                    round.number,
                    chunk.lb(),
                    chunk.ub(),
                    chunk.stride()
                );
                if chunk.stride() == 1 {
                    match ScheduleRun::new(&self.schedule, self.threads, chunk.lb(), chunk.ub()) {
                        Ok(run) => round.run = Some(Arc::new(run)),
                        Err(err) => {
                            // The schedule was validated up front, so only a
                            // malformed master chunk can land here.
                            self.stop.store(true, Ordering::Relaxed);
                            *self.pull_error.lock() = Some(SourceError::new(format!(
                                "coordinator handed an unusable chunk: {err}"
                            )));
                            return;
                        }
                    }
                }
                round.chunk = Some(chunk);
            }
            Ok(None) => {
                debug!(
                    "worker {} round {}: space exhausted",
                    self.template.rank(),
                    round.number
                );
            }
            Err(err) => {
                warn!("worker {} chunk pull failed: {}", self.template.rank(), err);
                self.stop.store(true, Ordering::Relaxed);
                *self.pull_error.lock() = Some(err);
            }
        }
    }
}

struct ClusterWorker<'a, L: Loop, S: ChunkSource> {
    body: BodyRef<'a, L>,
    shared: Arc<RoundShared<S>>,
}

impl<L: Loop, S: ChunkSource> ClusterWorker<'_, L, S> {
    /// Strided chunks are shared by the whole team at the coordinator's
    /// stride: thread r starts at `lb + r * stride` and steps by
    /// `threads * stride`. The arithmetic runs in `i128` so rank times stride
    /// cannot overflow near the edges of the index space.
    fn leapfrog(&mut self, chunk: Chunk, ctx: &mut LoopContext) -> Result<(), BodyError> {
        let stride = chunk.stride() as i128;
        let step = self.shared.threads as i128 * stride;
        let ub = chunk.ub() as i128;
        let mut index = chunk.lb() as i128 + ctx.rank() as i128 * stride;
        while index < ub && !ctx.stopped() {
            self.body.get_mut().run(index as i64, ctx)?;
            index += step;
        }
        Ok(())
    }
}

impl<L: Loop, S: ChunkSource> TeamWorker for ClusterWorker<'_, L, S> {
    fn split(&self) -> Self {
        ClusterWorker {
            body: BodyRef::Owned(self.body.get().split()),
            shared: Arc::clone(&self.shared),
        }
    }

    fn start(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.body.get_mut().start(ctx)
    }

    fn work(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        loop {
            // One coordinator request per round, issued by the last thread to
            // arrive; everyone else is blocked until the chunk is in place.
            if self.shared.barrier.wait_with(|| self.shared.pull_round()) == BarrierWait::Broken {
                break;
            }
            let (chunk, run) = {
                let round = self.shared.round.lock();
                (round.chunk, round.run.clone())
            };
            let chunk = match chunk {
                Some(chunk) => chunk,
                // Space exhausted (or stop requested): this worker is done.
                None => break,
            };
            if let Some(run) = run {
                let mut claimed = Claimed::new();
                while !ctx.stopped() {
                    let piece = match run.next(ctx.rank(), &mut claimed) {
                        Some(piece) => piece,
                        None => break,
                    };
                    for index in piece.indices() {
                        if ctx.stopped() {
                            break;
                        }
                        self.body.get_mut().run(index, ctx)?;
                    }
                }
            } else {
                self.leapfrog(chunk, ctx)?;
            }
        }
        // A recorded pull failure is surfaced by whichever thread takes it
        // first; the others exit cleanly through their finish hooks.
        if let Some(err) = self.shared.pull_error.lock().take() {
            return Err(Box::new(err));
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.body.get_mut().finish(ctx)
    }

    fn abort(&self) {
        // A failed or panicked teammate can no longer arrive; release anyone
        // blocked on the round barrier.
        self.shared.barrier.break_barrier();
    }
}
