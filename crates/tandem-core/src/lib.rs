//! Tandem-Core: iteration-space partitioning for parallel loops
//!
//! This crate provides the scheduling layer of the tandem runtime: it decides
//! how a half-open index range `[lb, ub)` is cut into [`Chunk`]s and handed to
//! the threads of a team.
//!
//! # Architecture
//!
//! The crate is built around three types:
//!
//! - [`Chunk`]: a contiguous sub-range of an iteration space with a stride and
//!   an owning rank
//! - [`Schedule`]: a value describing the partitioning policy (fixed, dynamic,
//!   guided, proportional) plus its chunk-size parameter
//! - [`ScheduleRun`]: the per-invocation shared state of one parallel loop,
//!   holding the atomic claim cursor the self-scheduling policies use
//!
//! # Thread Safety
//!
//! A `ScheduleRun` is shared by every thread of a team. All coordination goes
//! through a single atomic cursor claimed with compare-and-swap; there are no
//! locks on the claim path. `Schedule` and `Chunk` are plain values.
//!
//! # Overflow
//!
//! Chunk boundary arithmetic (rank times stride against very large ranges) is
//! carried out in `i128` so that no combination of `i64` bounds, stride and
//! thread count can overflow.

mod chunk;
mod error;
mod schedule;

pub use chunk::{Chunk, ChunkIndices};
pub use error::ScheduleError;
pub use schedule::{Claimed, Schedule, ScheduleRun, DEFAULT_CHUNK};
