use crate::error::ScheduleError;

/// A contiguous sub-range of an iteration space handed to one executor of
/// work.
///
/// A chunk covers the half-open range `[lb, ub)` with the given stride and is
/// owned exclusively by the consuming rank until its execution completes. The
/// rank field carries the team-thread rank for locally produced chunks and the
/// cluster-wide worker rank for chunks pulled from a coordinator.
///
/// Invariants (checked by [`Chunk::new`]): `lb <= ub` and `stride >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    lb: i64,
    ub: i64,
    stride: i64,
    rank: usize,
}

impl Chunk {
    /// Creates a new chunk covering `[lb, ub)` owned by `rank`.
    pub fn new(lb: i64, ub: i64, stride: i64, rank: usize) -> Result<Self, ScheduleError> {
        if lb > ub {
            return Err(ScheduleError::InvalidRange { lb, ub });
        }
        if stride < 1 {
            return Err(ScheduleError::InvalidStride(stride));
        }
        Ok(Chunk { lb, ub, stride, rank })
    }

    /// Creates a unit-stride chunk covering `[lb, ub)` owned by `rank`.
    pub fn contiguous(lb: i64, ub: i64, rank: usize) -> Result<Self, ScheduleError> {
        Chunk::new(lb, ub, 1, rank)
    }

    /// Lower bound, inclusive.
    #[inline]
    pub fn lb(&self) -> i64 {
        self.lb
    }

    /// Upper bound, exclusive.
    #[inline]
    pub fn ub(&self) -> i64 {
        self.ub
    }

    /// Distance between consecutive indices in this chunk.
    #[inline]
    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// Rank of the thread or worker process this chunk belongs to.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the same chunk re-tagged with a different owning rank.
    pub fn with_rank(self, rank: usize) -> Self {
        Chunk { rank, ..self }
    }

    /// Number of indices this chunk visits.
    pub fn len(&self) -> u64 {
        let span = (self.ub as i128) - (self.lb as i128);
        if span <= 0 {
            0
        } else {
            (((span - 1) / self.stride as i128) + 1) as u64
        }
    }

    /// True if the chunk visits no index at all.
    pub fn is_empty(&self) -> bool {
        self.lb >= self.ub
    }

    /// True if `index` is one of the indices this chunk visits.
    pub fn contains(&self, index: i64) -> bool {
        index >= self.lb && index < self.ub && (index - self.lb) % self.stride == 0
    }

    /// Iterates over the indices of this chunk in ascending order.
    pub fn indices(&self) -> ChunkIndices {
        ChunkIndices {
            next: self.lb as i128,
            ub: self.ub as i128,
            stride: self.stride as i128,
        }
    }
}

/// Iterator over the indices of a [`Chunk`].
///
/// Internal arithmetic is `i128` so a stride step can never overflow even at
/// the edges of the `i64` index space.
#[derive(Debug, Clone)]
pub struct ChunkIndices {
    next: i128,
    ub: i128,
    stride: i128,
}

impl Iterator for ChunkIndices {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.next >= self.ub {
            return None;
        }
        let index = self.next as i64;
        self.next += self.stride;
        Some(index)
    }
}
