//! Reduction variables.
//!
//! A reduction variable (Vbl) is a value type every team thread clones into a
//! private copy at loop start, mutates without synchronization during the
//! loop, and merges back into the shared original after the end-of-loop
//! barrier. The merge operation must be associative; the team folds the
//! per-thread copies in ascending rank order, so `reduce` authors may rely on
//! that order being deterministic but not on anything else.
//!
//! The predefined variables take their combinator as a constructor-time tag
//! (`LongOp`, `SetOp`, ...) rather than through subtyping, so a single type
//! covers sum, logical and/or/xor, set union/intersection and the
//! keep-smallest/keep-largest set reductions.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ShapeError;

/// Capability contract for reduction variables.
///
/// `reduce` merges `src` into `self` with an associative operation. It is
/// called only after every thread has finished loop-body code, one merge at a
/// time, so implementations need no internal synchronization. Merging two
/// structurally different variables must return a [`ShapeError`], never
/// silently adjust.
pub trait Vbl: Send + 'static {
    /// Creates an independent deep copy, used as a thread's private clone.
    fn clone_vbl(&self) -> Self
    where
        Self: Sized;

    /// Overwrites `self` with a deep copy of `src`.
    fn set(&mut self, src: &Self);

    /// Merges `src` into `self`.
    fn reduce(&mut self, src: &Self) -> Result<(), ShapeError>;
}

/// Object-safe view of [`Vbl`] used by the reduction map to hold entries of
/// different concrete types.
pub(crate) trait DynVbl: Send {
    fn clone_box(&self) -> Box<dyn DynVbl>;
    fn reduce_dyn(&mut self, src: &dyn DynVbl) -> Result<(), ShapeError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Vbl> DynVbl for T {
    fn clone_box(&self) -> Box<dyn DynVbl> {
        Box::new(self.clone_vbl())
    }

    fn reduce_dyn(&mut self, src: &dyn DynVbl) -> Result<(), ShapeError> {
        match src.as_any().downcast_ref::<T>() {
            Some(src) => self.reduce(src),
            None => Err(ShapeError::Type),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to the shared original of a reduction variable.
///
/// The enclosing computation creates the `SharedVbl` once, hands clones of
/// the handle to the loop body, and reads the reduced result through
/// [`get`](SharedVbl::get) after `exec` returns. During loop execution only
/// the per-thread private clones are mutated; the original is written exactly
/// once, by the reduction pass.
pub struct SharedVbl<T: Vbl> {
    pub(crate) cell: Arc<Mutex<T>>,
}

impl<T: Vbl> SharedVbl<T> {
    pub fn new(value: T) -> Self {
        SharedVbl { cell: Arc::new(Mutex::new(value)) }
    }

    /// Copies the current value out of the shared cell.
    pub fn get(&self) -> T {
        self.cell.lock().clone_vbl()
    }

    /// Runs `f` against the current shared value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.cell.lock())
    }

    /// Unwraps the shared value, or `None` while other handles still exist.
    pub fn into_inner(self) -> Option<T> {
        Arc::try_unwrap(self.cell).ok().map(Mutex::into_inner)
    }
}

impl<T: Vbl> Clone for SharedVbl<T> {
    fn clone(&self) -> Self {
        SharedVbl { cell: self.cell.clone() }
    }
}

/// Reduction operation tag for [`LongVbl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongOp {
    Sum,
    And,
    Or,
    Xor,
    Min,
    Max,
}

/// A 64-bit integer reduction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongVbl {
    pub value: i64,
    op: LongOp,
}

impl LongVbl {
    pub fn new(value: i64, op: LongOp) -> Self {
        LongVbl { value, op }
    }

    pub fn sum(value: i64) -> Self {
        LongVbl::new(value, LongOp::Sum)
    }

    pub fn min(value: i64) -> Self {
        LongVbl::new(value, LongOp::Min)
    }

    pub fn max(value: i64) -> Self {
        LongVbl::new(value, LongOp::Max)
    }
}

impl Vbl for LongVbl {
    fn clone_vbl(&self) -> Self {
        *self
    }

    fn set(&mut self, src: &Self) {
        *self = *src;
    }

    fn reduce(&mut self, src: &Self) -> Result<(), ShapeError> {
        self.value = match self.op {
            LongOp::Sum => self.value.wrapping_add(src.value),
            LongOp::And => self.value & src.value,
            LongOp::Or => self.value | src.value,
            LongOp::Xor => self.value ^ src.value,
            LongOp::Min => self.value.min(src.value),
            LongOp::Max => self.value.max(src.value),
        };
        Ok(())
    }
}

/// Reduction operation tag for [`DoubleVbl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleOp {
    Sum,
    Min,
    Max,
}

/// A 64-bit floating point reduction variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoubleVbl {
    pub value: f64,
    op: DoubleOp,
}

impl DoubleVbl {
    pub fn new(value: f64, op: DoubleOp) -> Self {
        DoubleVbl { value, op }
    }

    pub fn sum(value: f64) -> Self {
        DoubleVbl::new(value, DoubleOp::Sum)
    }
}

impl Vbl for DoubleVbl {
    fn clone_vbl(&self) -> Self {
        *self
    }

    fn set(&mut self, src: &Self) {
        *self = *src;
    }

    fn reduce(&mut self, src: &Self) -> Result<(), ShapeError> {
        self.value = match self.op {
            DoubleOp::Sum => self.value + src.value,
            DoubleOp::Min => self.value.min(src.value),
            DoubleOp::Max => self.value.max(src.value),
        };
        Ok(())
    }
}

/// Reduction operation tag for [`BooleanVbl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
    Xor,
}

/// A boolean reduction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BooleanVbl {
    pub value: bool,
    op: BoolOp,
}

impl BooleanVbl {
    pub fn new(value: bool, op: BoolOp) -> Self {
        BooleanVbl { value, op }
    }
}

impl Vbl for BooleanVbl {
    fn clone_vbl(&self) -> Self {
        *self
    }

    fn set(&mut self, src: &Self) {
        *self = *src;
    }

    fn reduce(&mut self, src: &Self) -> Result<(), ShapeError> {
        self.value = match self.op {
            BoolOp::And => self.value & src.value,
            BoolOp::Or => self.value | src.value,
            BoolOp::Xor => self.value ^ src.value,
        };
        Ok(())
    }
}

/// A frequency histogram over bins `0..bins`.
///
/// The merge adds the per-bin counts, so the reduced histogram is the one a
/// single thread would have produced from all samples. Two histograms reduce
/// only if they have the same bin count; anything else is a shape mismatch.
/// Accumulating into a bin outside the range leaves the histogram unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramVbl {
    counts: Vec<u64>,
    total: u64,
}

impl HistogramVbl {
    /// Creates an empty histogram with the given number of bins.
    pub fn new(bins: usize) -> Self {
        HistogramVbl { counts: vec![0; bins], total: 0 }
    }

    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    /// Count accumulated into `bin` so far.
    pub fn count(&self, bin: usize) -> u64 {
        self.counts.get(bin).copied().unwrap_or(0)
    }

    /// Total count across all bins.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Adds one occurrence to `bin`.
    pub fn accumulate(&mut self, bin: usize) {
        if let Some(count) = self.counts.get_mut(bin) {
            *count += 1;
            self.total += 1;
        }
    }
}

impl Vbl for HistogramVbl {
    fn clone_vbl(&self) -> Self {
        self.clone()
    }

    fn set(&mut self, src: &Self) {
        self.counts.clear();
        self.counts.extend_from_slice(&src.counts);
        self.total = src.total;
    }

    fn reduce(&mut self, src: &Self) -> Result<(), ShapeError> {
        if self.counts.len() != src.counts.len() {
            return Err(ShapeError::Bins {
                expected: self.counts.len(),
                got: src.counts.len(),
            });
        }
        for (dst, s) in self.counts.iter_mut().zip(&src.counts) {
            *dst += s;
        }
        self.total += src.total;
        Ok(())
    }
}

/// Reduction operation tag for [`BitSetVbl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// Elements present in any copy.
    Union,
    /// Elements present in every copy.
    Intersection,
    /// Keep the copy with the fewest elements (ties keep the lower rank).
    MinSize,
    /// Keep the copy with the most elements (ties keep the lower rank).
    MaxSize,
}

/// A set of integers `0..capacity` in bitmap representation.
///
/// Two sets reduce only if they hold the same number of words; anything else
/// is a shape mismatch. Adds and removes outside `0..capacity` leave the set
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSetVbl {
    words: Vec<u64>,
    op: SetOp,
}

impl BitSetVbl {
    /// Creates an empty set able to hold elements `0..max` (rounded up to a
    /// whole number of 64-bit words).
    pub fn new(max: usize, op: SetOp) -> Self {
        let words = (max + 63) / 64;
        BitSetVbl { words: vec![0; words.max(1)], op }
    }

    /// Largest storable element plus one.
    pub fn capacity(&self) -> usize {
        self.words.len() * 64
    }

    /// Number of elements currently in the set.
    pub fn size(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn contains(&self, elem: usize) -> bool {
        elem < self.capacity() && (self.words[elem / 64] >> (elem % 64)) & 1 == 1
    }

    pub fn add(&mut self, elem: usize) {
        if elem < self.capacity() {
            self.words[elem / 64] |= 1 << (elem % 64);
        }
    }

    /// Adds every element in `lb..ub` that fits in the set.
    pub fn add_range(&mut self, lb: usize, ub: usize) {
        for elem in lb..ub.min(self.capacity()) {
            self.add(elem);
        }
    }

    pub fn remove(&mut self, elem: usize) {
        if elem < self.capacity() {
            self.words[elem / 64] &= !(1 << (elem % 64));
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Elements of the set in ascending order.
    pub fn elements(&self) -> Vec<usize> {
        (0..self.capacity()).filter(|&e| self.contains(e)).collect()
    }

    fn check_shape(&self, src: &Self) -> Result<(), ShapeError> {
        if self.words.len() != src.words.len() {
            return Err(ShapeError::Words {
                expected: self.words.len(),
                got: src.words.len(),
            });
        }
        Ok(())
    }
}

impl Vbl for BitSetVbl {
    fn clone_vbl(&self) -> Self {
        self.clone()
    }

    fn set(&mut self, src: &Self) {
        self.words.clear();
        self.words.extend_from_slice(&src.words);
        self.op = src.op;
    }

    fn reduce(&mut self, src: &Self) -> Result<(), ShapeError> {
        self.check_shape(src)?;
        match self.op {
            SetOp::Union => {
                for (dst, s) in self.words.iter_mut().zip(&src.words) {
                    *dst |= s;
                }
            }
            SetOp::Intersection => {
                for (dst, s) in self.words.iter_mut().zip(&src.words) {
                    *dst &= s;
                }
            }
            SetOp::MinSize => {
                if src.size() < self.size() {
                    self.words.copy_from_slice(&src.words);
                }
            }
            SetOp::MaxSize => {
                if src.size() > self.size() {
                    self.words.copy_from_slice(&src.words);
                }
            }
        }
        Ok(())
    }
}
