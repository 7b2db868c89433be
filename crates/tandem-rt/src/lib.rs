//! Tandem-RT: a thread-team executor for parallel loops
//!
//! This crate runs a single logical loop across the cores of one machine. A
//! fixed-size team of threads shares one iteration space (partitioned by
//! `tandem-core` schedules, or element by element through a synchronized
//! iterator), accumulates into per-thread clones of shared reduction
//! variables, and merges those clones deterministically once every thread has
//! passed the end-of-loop barrier.
//!
//! # Architecture
//!
//! - [`parallel_for`] / [`ParallelFor`]: a parallel loop over an `i64` index
//!   range, with [`Loop`] as the per-thread body contract
//! - [`parallel_iter`] / [`ParallelIter`]: a parallel loop over a collection
//!   or iterator, with [`ObjectLoop`] as the body contract
//! - [`Vbl`] and the predefined reduction variables ([`LongVbl`],
//!   [`DoubleVbl`], [`BooleanVbl`], [`BitSetVbl`], [`HistogramVbl`]): the
//!   clone / set / associative-merge protocol per-thread results are combined
//!   with
//! - [`TeamWorker`] and [`execute`]: the generic team engine alternative
//!   work-sharing front-ends plug into (the cluster worker in
//!   `tandem-cluster` is one)
//!
//! # Usage
//!
//! ```no_run
//! use tandem_rt::{parallel_for, BodyError, LocalVbl, LongVbl, Loop, LoopContext, SharedVbl};
//!
//! struct CountEvens {
//!     total: SharedVbl<LongVbl>,
//!     local: Option<LocalVbl<LongVbl>>,
//! }
//!
//! impl Loop for CountEvens {
//!     fn split(&self) -> Self {
//!         CountEvens { total: self.total.clone(), local: None }
//!     }
//!
//!     fn start(&mut self, ctx: &mut LoopContext) -> Result<(), BodyError> {
//!         self.local = Some(ctx.thread_local(&self.total));
//!         Ok(())
//!     }
//!
//!     fn run(&mut self, index: i64, ctx: &mut LoopContext) -> Result<(), BodyError> {
//!         if index % 2 == 0 {
//!             let key = self.local.as_ref().copied();
//!             if let Some(key) = key {
//!                 ctx.local_mut(&key).value += 1;
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let total = SharedVbl::new(LongVbl::sum(0));
//! let mut body = CountEvens { total: total.clone(), local: None };
//! parallel_for(0..1_000_000).threads(4).exec(&mut body).unwrap();
//! assert_eq!(total.get().value, 500_000);
//! ```
//!
//! # Failure semantics
//!
//! A failing loop-body hook sets the team-wide stop flag; every other thread
//! finishes its current unit of work, runs its `finish()` hook and reaches
//! the barrier, after which the first-recorded failure is returned from
//! `exec` with the remaining ones attached as suppressed context. No thread
//! is ever force-killed and no partial reduction is published.

mod barrier;
mod error;
mod properties;
mod reduction;
mod sync_iter;
mod team;
mod vbl;

pub use barrier::{Barrier, BarrierWait};
pub use error::{BodyError, PanicFailure, ShapeError, TeamError};
pub use properties::{default_threads, ThreadCount, THREADS_ENV};
pub use reduction::{LocalVbl, ReductionMap};
pub use sync_iter::SyncIterator;
pub use team::{
    execute, parallel_for, parallel_iter, BodyRef, Loop, LoopContext, ObjectLoop, ParallelFor,
    ParallelIter, TeamWorker,
};
pub use vbl::{
    BitSetVbl, BoolOp, BooleanVbl, DoubleOp, DoubleVbl, HistogramVbl, LongOp, LongVbl, SetOp,
    SharedVbl, Vbl,
};
