// Integration tests for the master-worker protocol: several in-process
// workers draining one coordinator queue, leapfrog chunks, early stop and
// coordination failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use tandem_cluster::{
    ChunkSource, ChunkTemplate, QueueChunkSource, SourceError, WorkerError, WorkerParallelFor,
};
use tandem_core::{Chunk, Schedule};
use tandem_rt::{BodyError, LocalVbl, LongVbl, Loop, LoopContext, SharedVbl};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records every index it runs into a shared sink and counts finish hooks.
struct Collector {
    sink: Arc<Mutex<Vec<i64>>>,
    finished: Arc<AtomicUsize>,
}

impl Collector {
    fn new(sink: &Arc<Mutex<Vec<i64>>>, finished: &Arc<AtomicUsize>) -> Self {
        Collector { sink: sink.clone(), finished: finished.clone() }
    }
}

impl Loop for Collector {
    fn split(&self) -> Self {
        Collector::new(&self.sink, &self.finished)
    }

    fn run(&mut self, index: i64, _ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.sink.lock().push(index);
        Ok(())
    }

    fn finish(&mut self, _ctx: &mut LoopContext) -> Result<(), BodyError> {
        self.finished.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn three_workers_drain_one_coordinator_exactly_once() {
    init_logging();
    // 100 chunks of 10 covering [0, 1000), served first-come-first-served to
    // 3 worker processes of 4 threads each.
    let queue = QueueChunkSource::cut(0, 1000, 10).unwrap();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for worker_rank in 0..3usize {
            let queue = queue.clone();
            let sink = sink.clone();
            let finished = finished.clone();
            scope.spawn(move || {
                let source = Arc::new(QueueChunkSource::new(worker_rank, queue.clone()));
                let mut body = Collector::new(&sink, &finished);
                WorkerParallelFor::new(source)
                    .threads(4)
                    .schedule(Schedule::dynamic(3))
                    .exec(&mut body)
                    .unwrap();
                // A worker goes to its done state only once the coordinator
                // has nothing left to give it.
                assert!(queue.lock().is_empty());
            });
        }
    });

    let mut all = sink.lock().clone();
    all.sort_unstable();
    assert_eq!(all, (0..1000).collect::<Vec<_>>());
    // Every (worker, thread) pair ran its finish hook.
    assert_eq!(finished.load(Ordering::Relaxed), 3 * 4);
}

#[test]
fn strided_chunk_is_leapfrogged_across_the_team() {
    init_logging();
    // One chunk with stride 4 over [0, 100): the team must visit exactly the
    // multiples of 4, split thread by thread in leapfrog order.
    let queue = Arc::new(Mutex::new(
        vec![Chunk::new(0, 100, 4, 0).unwrap()].into_iter().collect(),
    ));
    let sink = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicUsize::new(0));

    let source = Arc::new(QueueChunkSource::new(0, queue));
    let mut body = Collector::new(&sink, &finished);
    WorkerParallelFor::new(source)
        .threads(2)
        .exec(&mut body)
        .unwrap();

    let mut all = sink.lock().clone();
    all.sort_unstable();
    assert_eq!(all, (0..100).step_by(4).collect::<Vec<i64>>());
}

#[test]
fn reductions_fold_per_worker() {
    init_logging();
    let queue = QueueChunkSource::cut(0, 200, 7).unwrap();
    let totals = Arc::new(Mutex::new(Vec::new()));

    struct Summing {
        total: SharedVbl<LongVbl>,
        key: Option<LocalVbl<LongVbl>>,
    }

    impl Loop for Summing {
        fn split(&self) -> Self {
            Summing { total: self.total.clone(), key: None }
        }

        fn start(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
            self.key = Some(ctx.thread_local(&self.total));
            Ok(())
        }

        fn run(&mut self, index: i64, ctx: &mut LoopContext) -> Result<(), BodyError> {
            let key = self.key.expect("registered");
            ctx.local_mut(&key).value += index;
            Ok(())
        }
    }

    thread::scope(|scope| {
        for worker_rank in 0..2usize {
            let queue = queue.clone();
            let totals = totals.clone();
            scope.spawn(move || {
                let source = Arc::new(QueueChunkSource::new(worker_rank, queue));
                let total = SharedVbl::new(LongVbl::sum(0));
                let mut body = Summing { total: total.clone(), key: None };
                WorkerParallelFor::new(source)
                    .threads(3)
                    .schedule(Schedule::guided(1))
                    .exec(&mut body)
                    .unwrap();
                totals.lock().push(total.get().value);
            });
        }
    });

    // Each index lands at exactly one worker, so the per-worker sums add up
    // to the sum over the whole range.
    let grand: i64 = totals.lock().iter().sum();
    assert_eq!(grand, (0..200).sum::<i64>());
}

#[test]
fn stop_ends_the_distributed_loop_for_this_worker() {
    init_logging();
    let queue = QueueChunkSource::cut(0, 50, 5).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    struct StopsEarly {
        finished: Arc<AtomicUsize>,
    }

    impl Loop for StopsEarly {
        fn split(&self) -> Self {
            StopsEarly { finished: self.finished.clone() }
        }

        fn run(&mut self, index: i64, ctx: &mut LoopContext) -> Result<(), BodyError> {
            if index == 3 {
                ctx.stop();
            }
            Ok(())
        }

        fn finish(&mut self, _ctx: &mut LoopContext) -> Result<(), BodyError> {
            self.finished.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    let source = Arc::new(QueueChunkSource::new(0, queue.clone()));
    let mut body = StopsEarly { finished: finished.clone() };
    WorkerParallelFor::new(source)
        .threads(2)
        .exec(&mut body)
        .unwrap();

    // The stop was raised inside the first master chunk; the next round's
    // pull observes it and leaves the remaining chunks at the coordinator.
    assert_eq!(queue.lock().len(), 9);
    assert_eq!(finished.load(Ordering::Relaxed), 2);
}

/// Serves a few chunks, then fails every subsequent pull.
struct FlakySource {
    queue: Mutex<Vec<Chunk>>,
}

impl ChunkSource for FlakySource {
    fn try_take(&self, _template: &ChunkTemplate) -> Result<Option<Chunk>, SourceError> {
        match self.queue.lock().pop() {
            Some(chunk) => Ok(Some(chunk)),
            None => Err(SourceError::new("tracker connection lost")),
        }
    }

    fn task_rank(&self) -> usize {
        0
    }
}

#[test]
fn pull_failure_is_fatal_and_surfaced_after_the_barrier() {
    init_logging();
    let finished = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(Mutex::new(Vec::new()));
    let source = Arc::new(FlakySource {
        queue: Mutex::new(vec![
            Chunk::contiguous(10, 20, 0).unwrap(),
            Chunk::contiguous(0, 10, 0).unwrap(),
        ]),
    });

    let mut body = Collector::new(&sink, &finished);
    let err = WorkerParallelFor::new(source)
        .threads(3)
        .exec(&mut body)
        .unwrap_err();

    assert!(matches!(err, WorkerError::Coordination(_)));
    // The two chunks served before the failure were fully processed. The one
    // thread that surfaces the pull failure skips its finish hook; its two
    // teammates exit cleanly through theirs.
    let mut all = sink.lock().clone();
    all.sort_unstable();
    assert_eq!(all, (0..20).collect::<Vec<_>>());
    assert_eq!(finished.load(Ordering::Relaxed), 2);
}
