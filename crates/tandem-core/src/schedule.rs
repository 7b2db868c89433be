use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::Backoff;
use log::trace;

use crate::chunk::Chunk;
use crate::error::ScheduleError;

/// Sentinel chunk-size value meaning "let the policy decide".
pub const DEFAULT_CHUNK: i64 = 0;

/// Divisor used to derive the default dynamic chunk size from the total
/// iteration count: `total / (threads * DYNAMIC_CHUNK_DIVISOR)`, floored at 1.
const DYNAMIC_CHUNK_DIVISOR: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Policy {
    Fixed,
    Dynamic,
    Guided,
    Proportional(Vec<u64>),
}

/// The policy and chunk-size parameter that decide how an iteration space is
/// divided among the threads of a team.
///
/// - **Fixed** divides the range into exactly T equal (plus or minus one)
///   pieces, one per thread, computed once.
/// - **Dynamic** repeatedly hands out fixed-size chunks on demand
///   (self-scheduling), balancing uneven per-iteration cost.
/// - **Guided** starts with large chunks and geometrically shrinks them as the
///   range is consumed; the chunk-size parameter is the minimum handout.
/// - **Proportional** divides the range into one piece per rank, sized in
///   proportion to an explicit per-rank weight, with remainder iterations
///   assigned to the earliest ranks.
///
/// The default schedule is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    policy: Policy,
    chunk: i64,
}

impl Schedule {
    /// Fixed partitioning: one equal-sized chunk per thread.
    pub fn fixed() -> Self {
        Schedule { policy: Policy::Fixed, chunk: DEFAULT_CHUNK }
    }

    /// Dynamic self-scheduling with the given handout size.
    ///
    /// Pass [`DEFAULT_CHUNK`] to derive the size from the total iteration
    /// count and thread count.
    pub fn dynamic(chunk: i64) -> Self {
        Schedule { policy: Policy::Dynamic, chunk }
    }

    /// Guided self-scheduling with the given minimum handout size.
    ///
    /// Pass [`DEFAULT_CHUNK`] for a minimum of one iteration.
    pub fn guided(min_chunk: i64) -> Self {
        Schedule { policy: Policy::Guided, chunk: min_chunk }
    }

    /// Proportional partitioning: rank `r` receives a share of the range
    /// proportional to `weights[r]`.
    pub fn proportional(weights: Vec<u64>) -> Self {
        Schedule { policy: Policy::Proportional(weights), chunk: DEFAULT_CHUNK }
    }

    /// Resolves the "default" chunk-size sentinel to the effective handout
    /// size this schedule will use over `total` iterations on `threads`
    /// threads.
    pub fn actual_chunk(&self, total: i64, threads: usize) -> i64 {
        let threads = threads.max(1) as i64;
        match self.policy {
            Policy::Fixed | Policy::Proportional(_) => {
                // One piece per rank; report the ceiling of an even split.
                if total <= 0 {
                    0
                } else {
                    (total + threads - 1) / threads
                }
            }
            Policy::Dynamic => {
                if self.chunk > 0 {
                    self.chunk
                } else {
                    (total / (threads * DYNAMIC_CHUNK_DIVISOR)).max(1)
                }
            }
            Policy::Guided => {
                if self.chunk > 0 {
                    self.chunk
                } else {
                    1
                }
            }
        }
    }

    /// Checks this schedule's parameters against a concrete thread count.
    pub fn validate(&self, threads: usize) -> Result<(), ScheduleError> {
        if threads == 0 {
            return Err(ScheduleError::InvalidThreads(threads));
        }
        if self.chunk < 0 {
            return Err(ScheduleError::InvalidChunk(self.chunk));
        }
        if let Policy::Proportional(ref weights) = self.policy {
            if weights.is_empty() {
                return Err(ScheduleError::EmptyWeights);
            }
            if weights.len() != threads {
                return Err(ScheduleError::WeightCount {
                    expected: threads,
                    got: weights.len(),
                });
            }
            if weights.iter().all(|&w| w == 0) {
                return Err(ScheduleError::ZeroWeights);
            }
        }
        Ok(())
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::fixed()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.policy {
            Policy::Fixed => write!(f, "fixed"),
            Policy::Dynamic => write!(f, "dynamic(chunk={})", self.chunk),
            Policy::Guided => write!(f, "guided(min={})", self.chunk),
            Policy::Proportional(w) => write!(f, "proportional(weights={:?})", w),
        }
    }
}

/// Per-thread claim state, reset for every new [`ScheduleRun`] round.
///
/// The one-shot policies (fixed, proportional) hand a rank its single chunk
/// exactly once; this records whether that handout already happened.
#[derive(Debug, Default)]
pub struct Claimed {
    taken: bool,
}

impl Claimed {
    pub fn new() -> Self {
        Claimed::default()
    }
}

/// The shared state of one parallel-loop invocation over `[lb, ub)`.
///
/// A `ScheduleRun` is created once per invocation (or, in cluster mode, once
/// per master-assigned chunk), shared by every team thread, and consulted via
/// [`ScheduleRun::next`] until it reports exhaustion.
///
/// # Thread Safety
///
/// The self-scheduling policies claim sub-ranges from a single `AtomicI64`
/// cursor with compare-and-swap; the critical section is a handful of
/// instructions and never blocks. The one-shot policies read precomputed
/// boundaries and touch no shared state at all.
pub struct ScheduleRun {
    policy: Policy,
    threads: usize,
    lb: i64,
    ub: i64,
    /// Effective handout size (dynamic) or minimum handout size (guided).
    chunk: i64,
    /// Next unclaimed index for the self-scheduling policies.
    cursor: AtomicI64,
    /// Piece boundaries for the one-shot policies: `threads + 1` entries,
    /// rank r owns `[bounds[r], bounds[r + 1])`.
    bounds: Vec<i64>,
}

impl ScheduleRun {
    /// Creates the shared schedule state for one loop over `[lb, ub)`.
    pub fn new(
        schedule: &Schedule,
        threads: usize,
        lb: i64,
        ub: i64,
    ) -> Result<Self, ScheduleError> {
        schedule.validate(threads)?;
        if lb > ub {
            return Err(ScheduleError::InvalidRange { lb, ub });
        }
        let total = (ub as i128) - (lb as i128);
        let bounds = match schedule.policy {
            Policy::Fixed => even_bounds(lb, total, threads),
            Policy::Proportional(ref weights) => weighted_bounds(lb, total, weights),
            _ => Vec::new(),
        };
        // The full i64 range divided by the divisor always fits back in i64.
        let chunk = match schedule.policy {
            Policy::Dynamic => {
                if schedule.chunk > 0 {
                    schedule.chunk
                } else {
                    (total / (threads as i128 * DYNAMIC_CHUNK_DIVISOR as i128)).max(1) as i64
                }
            }
            Policy::Guided => schedule.chunk.max(1),
            _ => DEFAULT_CHUNK,
        };
        Ok(ScheduleRun {
            policy: schedule.policy.clone(),
            threads,
            lb,
            ub,
            chunk,
            cursor: AtomicI64::new(lb),
            bounds,
        })
    }

    /// Number of team threads this run partitions for.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Lower bound of the iteration space, inclusive.
    pub fn lb(&self) -> i64 {
        self.lb
    }

    /// Upper bound of the iteration space, exclusive.
    pub fn ub(&self) -> i64 {
        self.ub
    }

    /// The one-shot piece owned by `rank`, if this run uses a one-shot policy
    /// (fixed or proportional).
    pub fn chunk_for(&self, rank: usize) -> Option<Chunk> {
        if self.bounds.is_empty() || rank >= self.threads {
            return None;
        }
        // Bounds are inside [lb, ub] and ascending, so this cannot fail.
        Chunk::contiguous(self.bounds[rank], self.bounds[rank + 1], rank).ok()
    }

    /// Claims the next unit of work for `rank`, or `None` once the range is
    /// exhausted (for one-shot policies: once the rank's piece was handed
    /// out).
    pub fn next(&self, rank: usize, claimed: &mut Claimed) -> Option<Chunk> {
        let chunk = match self.policy {
            Policy::Fixed | Policy::Proportional(_) => {
                if claimed.taken {
                    return None;
                }
                claimed.taken = true;
                let piece = self.chunk_for(rank)?;
                if piece.is_empty() {
                    return None;
                }
                piece
            }
            Policy::Dynamic => self.claim(rank, |_remaining| self.chunk)?,
            Policy::Guided => {
                self.claim(rank, |remaining| {
                    let share = (remaining / self.threads as i128).min(i64::MAX as i128) as i64;
                    share.max(self.chunk)
                })?
            }
        };
        trace!(
            "rank {} claimed [{}, {}) of [{}, {})",
            rank,
            chunk.lb(),
            chunk.ub(),
            self.lb,
            self.ub
        );
        Some(chunk)
    }

    /// Atomically claims the next sub-range, sized by `size_of` applied to the
    /// number of remaining iterations.
    fn claim<F: Fn(i128) -> i64>(&self, rank: usize, size_of: F) -> Option<Chunk> {
        let backoff = Backoff::new();
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            if cur >= self.ub {
                return None;
            }
            // The remaining count exceeds i64 for a range spanning most of
            // the index space.
            let size = size_of(self.ub as i128 - cur as i128).max(1);
            let end = cur.saturating_add(size).min(self.ub);
            match self
                .cursor
                .compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                // The CAS established cur <= end <= ub, so this cannot fail.
                Ok(_) => return Chunk::contiguous(cur, end, rank).ok(),
                Err(observed) => {
                    cur = observed;
                    backoff.spin();
                }
            }
        }
    }
}

/// Boundaries of T equal (plus or minus one) pieces over `[lb, lb + total)`,
/// with earlier ranks taking the extra iterations.
fn even_bounds(lb: i64, total: i128, threads: usize) -> Vec<i64> {
    let t = threads as i128;
    let base = total / t;
    let rem = total % t;
    let mut bounds = Vec::with_capacity(threads + 1);
    let mut at = lb as i128;
    bounds.push(lb);
    for rank in 0..threads as i128 {
        at += base + if rank < rem { 1 } else { 0 };
        bounds.push(at as i64);
    }
    bounds
}

/// Boundaries of pieces sized proportionally to the per-rank weights, with
/// remainder iterations assigned to the earliest ranks.
fn weighted_bounds(lb: i64, total: i128, weights: &[u64]) -> Vec<i64> {
    let sum: i128 = weights.iter().map(|&w| w as i128).sum();
    let mut shares: Vec<i128> = weights
        .iter()
        .map(|&w| total * w as i128 / sum)
        .collect();
    let assigned: i128 = shares.iter().sum();
    let mut rem = total - assigned;
    for share in shares.iter_mut() {
        if rem == 0 {
            break;
        }
        *share += 1;
        rem -= 1;
    }
    let mut bounds = Vec::with_capacity(weights.len() + 1);
    let mut at = lb as i128;
    bounds.push(lb);
    for share in shares {
        at += share;
        bounds.push(at as i64);
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(run: &ScheduleRun, rank: usize) -> Vec<Chunk> {
        let mut claimed = Claimed::new();
        let mut chunks = Vec::new();
        while let Some(chunk) = run.next(rank, &mut claimed) {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn fixed_ten_over_three() {
        let run = ScheduleRun::new(&Schedule::fixed(), 3, 0, 10).unwrap();
        let pieces: Vec<_> = (0..3)
            .map(|r| run.chunk_for(r).unwrap())
            .map(|c| (c.lb(), c.ub()))
            .collect();
        assert_eq!(pieces, vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn fixed_partition_is_disjoint_exact_cover() {
        for threads in 1..=8usize {
            for n in 0..=50i64 {
                let run = ScheduleRun::new(&Schedule::fixed(), threads, 0, n).unwrap();
                let mut covered = 0i64;
                let mut at = 0i64;
                let mut sizes = Vec::new();
                for rank in 0..threads {
                    let piece = run.chunk_for(rank).unwrap();
                    assert_eq!(piece.lb(), at, "pieces must tile the range");
                    at = piece.ub();
                    covered += piece.len() as i64;
                    sizes.push(piece.len());
                }
                assert_eq!(at, n);
                assert_eq!(covered, n);
                let min = sizes.iter().min().unwrap();
                let max = sizes.iter().max().unwrap();
                assert!(max - min <= 1, "fixed pieces may differ by at most 1");
            }
        }
    }

    #[test]
    fn fixed_hands_out_each_piece_once() {
        let run = ScheduleRun::new(&Schedule::fixed(), 2, 0, 10).unwrap();
        let chunks = drain(&run, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].lb(), chunks[0].ub()), (0, 5));
    }

    #[test]
    fn dynamic_visits_every_index_once() {
        let run = ScheduleRun::new(&Schedule::dynamic(3), 4, 0, 20).unwrap();
        let mut seen = Vec::new();
        // Interleave claims from several ranks on one thread; coverage must
        // still be exact.
        let mut claims: Vec<Claimed> = (0..4).map(|_| Claimed::new()).collect();
        loop {
            let mut progressed = false;
            for rank in 0..4 {
                if let Some(chunk) = run.next(rank, &mut claims[rank]) {
                    assert!(chunk.len() <= 3);
                    seen.extend(chunk.indices());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn dynamic_default_chunk_scales_with_range() {
        let schedule = Schedule::dynamic(DEFAULT_CHUNK);
        assert_eq!(schedule.actual_chunk(100_000, 4), 250);
        assert_eq!(schedule.actual_chunk(10, 4), 1);
        assert_eq!(Schedule::dynamic(7).actual_chunk(100_000, 4), 7);
    }

    #[test]
    fn guided_chunks_shrink_and_cover() {
        let run = ScheduleRun::new(&Schedule::guided(1), 4, 0, 1000).unwrap();
        let chunks = drain(&run, 0);
        let mut seen = Vec::new();
        for pair in chunks.windows(2) {
            assert!(pair[1].len() <= pair[0].len(), "guided handouts must shrink");
        }
        for chunk in &chunks {
            seen.extend(chunk.indices());
        }
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
        // First handout is remaining / threads.
        assert_eq!(chunks[0].len(), 250);
    }

    #[test]
    fn guided_respects_minimum_chunk() {
        let run = ScheduleRun::new(&Schedule::guided(10), 4, 0, 100).unwrap();
        let chunks = drain(&run, 0);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= 10);
        }
    }

    #[test]
    fn proportional_shares_follow_weights() {
        let run =
            ScheduleRun::new(&Schedule::proportional(vec![1, 2, 1]), 3, 0, 8).unwrap();
        let pieces: Vec<_> = (0..3)
            .map(|r| run.chunk_for(r).unwrap())
            .map(|c| (c.lb(), c.ub()))
            .collect();
        assert_eq!(pieces, vec![(0, 2), (2, 6), (6, 8)]);
    }

    #[test]
    fn proportional_remainder_goes_to_earliest_ranks() {
        let run =
            ScheduleRun::new(&Schedule::proportional(vec![1, 1, 1]), 3, 0, 10).unwrap();
        let sizes: Vec<_> = (0..3).map(|r| run.chunk_for(r).unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn zero_weight_rank_gets_empty_piece() {
        let run =
            ScheduleRun::new(&Schedule::proportional(vec![0, 1]), 2, 0, 6).unwrap();
        assert!(run.chunk_for(0).unwrap().is_empty());
        assert_eq!(run.chunk_for(1).unwrap().len(), 6);
        // next() skips the empty piece entirely.
        assert!(run.next(0, &mut Claimed::new()).is_none());
    }

    #[test]
    fn construction_rejects_bad_parameters() {
        assert!(matches!(
            ScheduleRun::new(&Schedule::fixed(), 0, 0, 10),
            Err(ScheduleError::InvalidThreads(0))
        ));
        assert!(matches!(
            ScheduleRun::new(&Schedule::dynamic(-1), 2, 0, 10),
            Err(ScheduleError::InvalidChunk(-1))
        ));
        assert!(matches!(
            ScheduleRun::new(&Schedule::fixed(), 2, 10, 0),
            Err(ScheduleError::InvalidRange { lb: 10, ub: 0 })
        ));
        assert!(matches!(
            ScheduleRun::new(&Schedule::proportional(vec![]), 2, 0, 10),
            Err(ScheduleError::EmptyWeights)
        ));
        assert!(matches!(
            ScheduleRun::new(&Schedule::proportional(vec![1]), 2, 0, 10),
            Err(ScheduleError::WeightCount { expected: 2, got: 1 })
        ));
        assert!(matches!(
            ScheduleRun::new(&Schedule::proportional(vec![0, 0]), 2, 0, 10),
            Err(ScheduleError::ZeroWeights)
        ));
    }

    #[test]
    fn self_scheduling_survives_a_range_wider_than_i64() {
        // [i64::MIN, i64::MAX) holds more indices than i64 can count; the
        // claim path must size handouts without overflowing.
        let run = ScheduleRun::new(&Schedule::dynamic(1), 2, i64::MIN, i64::MAX).unwrap();
        let first = run.next(0, &mut Claimed::new()).unwrap();
        assert_eq!((first.lb(), first.ub()), (i64::MIN, i64::MIN + 1));

        let run = ScheduleRun::new(&Schedule::guided(1), 2, i64::MIN, i64::MAX).unwrap();
        let first = run.next(0, &mut Claimed::new()).unwrap();
        assert_eq!(first.lb(), i64::MIN);
        assert!(first.ub() < i64::MAX);
        let second = run.next(1, &mut Claimed::new()).unwrap();
        assert_eq!(second.lb(), first.ub());
    }

    #[test]
    fn empty_range_yields_no_work() {
        for schedule in [Schedule::fixed(), Schedule::dynamic(4), Schedule::guided(1)] {
            let run = ScheduleRun::new(&schedule, 3, 5, 5).unwrap();
            assert!(run.next(0, &mut Claimed::new()).is_none());
        }
    }
}
