//! Sorted, coalescing list of free ranges.
//!
//! Ranges are kept ordered by start address in a [`RangeStorage`]. The
//! default storage is a fixed-size inline table, so the list never allocates
//! and the heap can use it for its own page bookkeeping without re-entering
//! itself. With the `alloc` feature a `Vec` can back the list instead, which
//! lifts the limit on the number of disjoint ranges.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, Sub};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::warn;

use crate::{AllocError, AllocResult};

/// Default number of disjoint free ranges an inline [`RangeList`] can hold.
pub const DEFAULT_RANGE_CAPACITY: usize = 128;

/// Integer types a [`RangeList`] can track.
pub trait RangeAddr:
    Copy + Ord + Add<Output = Self> + Sub<Output = Self> + fmt::Debug + fmt::LowerHex
{
    const ZERO: Self;

    fn checked_add(self, rhs: Self) -> Option<Self>;
}

macro_rules! impl_range_addr {
    ($($ty:ty),*) => {
        $(
            impl RangeAddr for $ty {
                const ZERO: Self = 0;

                #[inline]
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_add(self, rhs)
                }
            }
        )*
    };
}

impl_range_addr!(u8, u16, u32, u64, usize);

/// A half-open range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range<T> {
    pub start: T,
    pub length: T,
}

impl<T: RangeAddr> Range<T> {
    const EMPTY: Self = Range {
        start: T::ZERO,
        length: T::ZERO,
    };

    pub const fn new(start: T, length: T) -> Self {
        Self { start, length }
    }

    /// One past the last unit of the range.
    #[inline]
    pub fn end(&self) -> T {
        self.start + self.length
    }
}

/// Backing table of a [`RangeList`].
///
/// The list decides where entries go; a storage only shifts them around.
pub trait RangeStorage<T> {
    fn as_slice(&self) -> &[Range<T>];

    fn as_mut_slice(&mut self) -> &mut [Range<T>];

    /// Insert `range` at `index`, shifting later entries up.
    ///
    /// Fails with `NoMemory`, leaving the table unchanged, when there is no
    /// room for another entry.
    fn insert(&mut self, index: usize, range: Range<T>) -> AllocResult;

    /// Remove the entries `from..to`.
    fn remove_span(&mut self, from: usize, to: usize);

    fn clear(&mut self);

    /// Most entries the table can hold, `None` if it grows on demand.
    fn capacity(&self) -> Option<usize>;
}

/// Fixed-size inline table of at most `N` ranges.
pub struct InlineRanges<T, const N: usize> {
    ranges: [Range<T>; N],
    len: usize,
}

impl<T: RangeAddr, const N: usize> InlineRanges<T, N> {
    pub const fn new() -> Self {
        Self {
            ranges: [Range::EMPTY; N],
            len: 0,
        }
    }
}

impl<T: RangeAddr, const N: usize> Default for InlineRanges<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RangeAddr, const N: usize> RangeStorage<T> for InlineRanges<T, N> {
    fn as_slice(&self) -> &[Range<T>] {
        &self.ranges[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [Range<T>] {
        &mut self.ranges[..self.len]
    }

    fn insert(&mut self, index: usize, range: Range<T>) -> AllocResult {
        if self.len == N {
            return Err(AllocError::NoMemory);
        }
        self.ranges.copy_within(index..self.len, index + 1);
        self.ranges[index] = range;
        self.len += 1;
        Ok(())
    }

    fn remove_span(&mut self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        self.ranges.copy_within(to..self.len, from);
        self.len -= to - from;
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn capacity(&self) -> Option<usize> {
        Some(N)
    }
}

#[cfg(feature = "alloc")]
impl<T: RangeAddr> RangeStorage<T> for Vec<Range<T>> {
    fn as_slice(&self) -> &[Range<T>] {
        Vec::as_slice(self)
    }

    fn as_mut_slice(&mut self) -> &mut [Range<T>] {
        Vec::as_mut_slice(self)
    }

    fn insert(&mut self, index: usize, range: Range<T>) -> AllocResult {
        self.try_reserve(1).map_err(|_| AllocError::NoMemory)?;
        Vec::insert(self, index, range);
        Ok(())
    }

    fn remove_span(&mut self, from: usize, to: usize) {
        self.drain(from..to);
    }

    fn clear(&mut self) {
        Vec::clear(self);
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// A [`RangeList`] that grows its table on demand.
#[cfg(feature = "alloc")]
pub type GrowableRangeList<T> = RangeList<T, Vec<Range<T>>>;

/// A set of disjoint free ranges.
///
/// Invariants: the entries are sorted by start, never overlap, and never
/// touch. Every mutation either applies fully or leaves the list untouched.
///
/// With [`InlineRanges`] a caller that needs more than `N` disjoint ranges
/// sees `NoMemory` from [`free`](Self::free) and must size `N` for its
/// address space: `N` entries always describe any free set over `2 * N`
/// units, because free ranges never touch.
pub struct RangeList<T: RangeAddr, S: RangeStorage<T> = InlineRanges<T, DEFAULT_RANGE_CAPACITY>> {
    store: S,
    _addr: PhantomData<T>,
}

impl<T: RangeAddr, const N: usize> RangeList<T, InlineRanges<T, N>> {
    /// Create an empty range list
    pub const fn new() -> Self {
        Self::with_storage(InlineRanges::new())
    }
}

impl<T: RangeAddr, S: RangeStorage<T>> RangeList<T, S> {
    /// Create a range list over `store`, which must be empty.
    pub const fn with_storage(store: S) -> Self {
        Self {
            store,
            _addr: PhantomData,
        }
    }

    /// Create a range list holding one free range
    pub fn with_range(start: T, length: T) -> AllocResult<Self>
    where
        S: Default,
    {
        let mut list = Self::with_storage(S::default());
        list.free(start, length)?;
        Ok(list)
    }

    /// Number of disjoint free ranges.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    /// Most disjoint ranges the list can hold, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.store.capacity()
    }

    /// Get the free range at `index` (ordered by start address).
    pub fn range(&self, index: usize) -> Option<Range<T>> {
        self.live().get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<T>> + '_ {
        self.live().iter().copied()
    }

    /// Sum of the lengths of all free ranges.
    pub fn total_free(&self) -> T {
        self.iter().fold(T::ZERO, |acc, r| acc + r.length)
    }

    /// Whether `[start, start + length)` is entirely free.
    pub fn contains(&self, start: T, length: T) -> bool {
        let Some(end) = start.checked_add(length) else {
            return false;
        };
        match self.covering(start) {
            Some(idx) => self.live()[idx].end() >= end,
            None => false,
        }
    }

    /// Drop every tracked range.
    pub fn clear(&mut self) {
        self.store.clear();
    }

    /// Mark `[start, start + length)` as free.
    ///
    /// Overlapping and adjacent free ranges are merged into one, so freeing an
    /// already free range is a no-op. Fails with `NoMemory` only when a new
    /// entry is needed and a fixed-size table is full.
    pub fn free(&mut self, start: T, length: T) -> AllocResult {
        if length == T::ZERO {
            return Err(AllocError::InvalidParam);
        }
        let end = start.checked_add(length).ok_or(AllocError::InvalidParam)?;

        // Ranges in first..last overlap or touch the new one.
        let first = self.live().partition_point(|r| r.end() < start);
        let last = self.live().partition_point(|r| r.start <= end);

        if first == last {
            return self.insert(first, Range::new(start, length));
        }

        let ranges = self.store.as_mut_slice();
        let merged_start = start.min(ranges[first].start);
        let merged_end = end.max(ranges[last - 1].end());
        ranges[first] = Range::new(merged_start, merged_end - merged_start);
        self.store.remove_span(first + 1, last);
        Ok(())
    }

    /// Allocate `length` units from the first free range large enough.
    ///
    /// Returns the start of the allocated range. The rest of the chosen range
    /// stays free, so this never needs a new entry.
    pub fn allocate(&mut self, length: T) -> AllocResult<T> {
        if length == T::ZERO {
            return Err(AllocError::InvalidParam);
        }

        let Some(idx) = self.live().iter().position(|r| r.length >= length) else {
            return Err(AllocError::NoMemory);
        };

        let range = &mut self.store.as_mut_slice()[idx];
        let start = range.start;
        if range.length == length {
            self.store.remove_span(idx, idx + 1);
        } else {
            range.start = start + length;
            range.length = range.length - length;
        }
        Ok(start)
    }

    /// Allocate exactly `[start, start + length)`.
    ///
    /// Succeeds only if the whole range is currently free. On failure the list
    /// is unchanged.
    pub fn allocate_specific(&mut self, start: T, length: T) -> AllocResult {
        if length == T::ZERO {
            return Err(AllocError::InvalidParam);
        }
        let end = start.checked_add(length).ok_or(AllocError::InvalidParam)?;

        let idx = self.covering(start).ok_or(AllocError::NotAllocated)?;
        let range = self.live()[idx];
        if range.end() < end {
            return Err(AllocError::NotAllocated);
        }

        let head = start - range.start;
        let tail = range.end() - end;
        match (head == T::ZERO, tail == T::ZERO) {
            (true, true) => self.store.remove_span(idx, idx + 1),
            (true, false) => self.store.as_mut_slice()[idx] = Range::new(end, tail),
            (false, true) => self.store.as_mut_slice()[idx].length = head,
            (false, false) => {
                self.insert(idx + 1, Range::new(end, tail))?;
                self.store.as_mut_slice()[idx].length = head;
            }
        }
        Ok(())
    }

    fn live(&self) -> &[Range<T>] {
        self.store.as_slice()
    }

    /// Index of the last range starting at or before `addr`, if it reaches past `addr`.
    fn covering(&self, addr: T) -> Option<usize> {
        let idx = self.live().partition_point(|r| r.start <= addr);
        if idx == 0 {
            return None;
        }
        let range = &self.live()[idx - 1];
        (range.end() > addr).then_some(idx - 1)
    }

    fn insert(&mut self, idx: usize, range: Range<T>) -> AllocResult {
        let result = self.store.insert(idx, range);
        if result.is_err() {
            warn!(
                "range list: table full ({} ranges), cannot track [{:#x}, +{:#x})",
                self.len(),
                range.start,
                range.length
            );
        }
        result
    }
}

impl<T: RangeAddr, S: RangeStorage<T> + Default> Default for RangeList<T, S> {
    fn default() -> Self {
        Self::with_storage(S::default())
    }
}

impl<T: RangeAddr, S: RangeStorage<T>> fmt::Debug for RangeList<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|r| (r.start, r.end())))
            .finish()
    }
}
