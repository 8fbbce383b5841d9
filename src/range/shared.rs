//! Lock-protected range list for subsystems that share one address domain.

use kspin::SpinNoIrq;

use super::range_list::{
    InlineRanges, Range, RangeAddr, RangeList, RangeStorage, DEFAULT_RANGE_CAPACITY,
};
use crate::AllocResult;

/// A [`RangeList`] behind an IRQ-safe spin lock.
///
/// Each resource domain (physical pages, I/O ports, MMIO windows) owns its own
/// instance; instances never coordinate with each other.
pub struct SharedRangeList<
    T: RangeAddr,
    S: RangeStorage<T> = InlineRanges<T, DEFAULT_RANGE_CAPACITY>,
> {
    inner: SpinNoIrq<RangeList<T, S>>,
}

impl<T: RangeAddr, const N: usize> SharedRangeList<T, InlineRanges<T, N>> {
    pub const fn new() -> Self {
        Self {
            inner: SpinNoIrq::new(RangeList::new()),
        }
    }
}

impl<T: RangeAddr, S: RangeStorage<T>> SharedRangeList<T, S> {
    pub fn free(&self, start: T, length: T) -> AllocResult {
        self.inner.lock().free(start, length)
    }

    pub fn allocate(&self, length: T) -> AllocResult<T> {
        self.inner.lock().allocate(length)
    }

    pub fn allocate_specific(&self, start: T, length: T) -> AllocResult {
        self.inner.lock().allocate_specific(start, length)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn total_free(&self) -> T {
        self.inner.lock().total_free()
    }

    pub fn range(&self, index: usize) -> Option<Range<T>> {
        self.inner.lock().range(index)
    }

    /// Run `f` with the list locked, for multi-step updates that must be atomic.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut RangeList<T, S>) -> R) -> R {
        f(&mut *self.inner.lock())
    }
}

impl<T: RangeAddr, S: RangeStorage<T> + Default> Default for SharedRangeList<T, S> {
    fn default() -> Self {
        Self::from(RangeList::default())
    }
}

impl<T: RangeAddr, S: RangeStorage<T>> From<RangeList<T, S>> for SharedRangeList<T, S> {
    fn from(list: RangeList<T, S>) -> Self {
        Self {
            inner: SpinNoIrq::new(list),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AllocError;

    #[test]
    fn test_shared_io_ports() {
        let ports = SharedRangeList::<u16, InlineRanges<u16, 16>>::new();
        ports.free(0x0000, 0x1000).unwrap();

        // Legacy devices reserve fixed windows.
        ports.allocate_specific(0x3f8, 8).unwrap();
        ports.allocate_specific(0x60, 1).unwrap();
        assert_eq!(ports.allocate_specific(0x3f8, 8), Err(AllocError::NotAllocated));

        let dynamic = ports.allocate(0x20).unwrap();
        assert_eq!(dynamic, 0);
        assert_eq!(ports.total_free(), 0x1000 - 8 - 1 - 0x20);

        ports.free(0x3f8, 8).unwrap();
        ports.free(0x60, 1).unwrap();
        ports.free(dynamic, 0x20).unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports.range(0), Some(Range::new(0, 0x1000)));
    }

    #[test]
    fn test_with_locked() {
        let list = RangeList::<usize, InlineRanges<usize, 8>>::with_range(0x10_0000, 0x10_0000).unwrap();
        let mmio = SharedRangeList::from(list);
        let (a, b) = mmio.with_locked(|l| (l.allocate(0x1000), l.allocate(0x1000)));
        assert_eq!(a, Ok(0x10_0000));
        assert_eq!(b, Ok(0x10_1000));
        mmio.clear();
        assert!(mmio.is_empty());
    }
}
