//! Global allocator implementation for the kernel heap.
//!
//! This module wraps a [`SlabHeap`] in an IRQ-safe spin lock so it can be
//! shared between CPUs and installed with `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::warn;

#[cfg(feature = "tracking")]
use crate::slab::HeapStats;
use crate::mapper::PageMapper;
use crate::slab::{SlabHeap, DEFAULT_HEAP_RANGES, OBJECT_ALIGN};
use crate::AllocResult;

/// Slab heap behind an IRQ-safe lock
pub struct LockedSlabHeap<
    M: PageMapper,
    const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE },
    const HEAP_RANGES: usize = DEFAULT_HEAP_RANGES,
> {
    heap: SpinNoIrq<SlabHeap<M, PAGE_SIZE, HEAP_RANGES>>,
}

impl<M: PageMapper, const PAGE_SIZE: usize, const HEAP_RANGES: usize>
    LockedSlabHeap<M, PAGE_SIZE, HEAP_RANGES>
{
    pub const fn new(mapper: M) -> Self {
        Self {
            heap: SpinNoIrq::new(SlabHeap::new(mapper)),
        }
    }

    /// Reset the heap to its empty state.
    pub fn initialise(&self) {
        self.heap.lock().initialise();
    }

    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.heap.lock().allocate(size)
    }

    /// Free an object; heap corruption is fatal.
    pub fn free(&self, ptr: NonNull<u8>) {
        self.heap.lock().free(ptr);
    }

    pub fn try_free(&self, ptr: NonNull<u8>) -> AllocResult {
        self.heap.lock().try_free(ptr)
    }

    pub fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> AllocResult<NonNull<u8>> {
        self.heap.lock().reallocate(ptr, new_size)
    }

    /// Return the pages of empty slabs to the mapper.
    pub fn recovery(&self) -> usize {
        self.heap.lock().recovery()
    }

    pub fn heap_page_count(&self) -> usize {
        self.heap.lock().heap_page_count()
    }

    pub fn managed_pages(&self) -> usize {
        self.heap.lock().managed_pages()
    }

    pub fn free_pages(&self) -> usize {
        self.heap.lock().free_pages()
    }

    pub fn usable_size(&self, ptr: NonNull<u8>) -> AllocResult<usize> {
        self.heap.lock().usable_size(ptr)
    }

    pub fn check(&self) -> AllocResult {
        self.heap.lock().check()
    }

    pub fn set_vigilant(&self, vigilant: bool) {
        self.heap.lock().set_vigilant(vigilant);
    }

    /// Run `f` with the heap locked.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut SlabHeap<M, PAGE_SIZE, HEAP_RANGES>) -> R) -> R {
        f(&mut *self.heap.lock())
    }

    /// Get heap statistics
    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> AllocResult<HeapStats> {
        self.heap.lock().stats()
    }
}

unsafe impl<M: PageMapper, const PAGE_SIZE: usize, const HEAP_RANGES: usize> GlobalAlloc
    for LockedSlabHeap<M, PAGE_SIZE, HEAP_RANGES>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > OBJECT_ALIGN {
            warn!(
                "global allocator: alignment {} of {:?} not supported",
                layout.align(),
                layout
            );
            return core::ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_e) => {
                warn!(
                    "global allocator: allocation of {:?} failed: {:?}",
                    layout, _e
                );
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
        };
        match self.reallocate(old, new_size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_e) => {
                warn!(
                    "global allocator: reallocation to {} bytes failed: {:?}",
                    new_size, _e
                );
                core::ptr::null_mut()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::RegionMapper;
    use crate::AllocError;
    use alloc::alloc::{alloc, dealloc};

    const PAGE_SIZE: usize = 0x1000;
    const HEAP_SIZE: usize = 64 * PAGE_SIZE;

    fn with_heap(f: impl FnOnce(&LockedSlabHeap<RegionMapper<PAGE_SIZE>, PAGE_SIZE>)) {
        let layout = Layout::from_size_align(HEAP_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc(layout) } as usize;
        assert_ne!(base, 0);
        let heap = LockedSlabHeap::new(unsafe { RegionMapper::new(base, HEAP_SIZE) });
        heap.initialise();
        f(&heap);
        unsafe { dealloc(base as *mut u8, layout) };
    }

    #[test]
    fn test_global_alloc() {
        with_heap(|heap| unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0xaa, 100);
            heap.dealloc(ptr, layout);
            assert_eq!(heap.heap_page_count(), 1);
            assert_eq!(heap.recovery(), 1);
        });
    }

    #[test]
    fn test_alignment_limit() {
        with_heap(|heap| unsafe {
            let ok = Layout::from_size_align(64, OBJECT_ALIGN).unwrap();
            let ptr = heap.alloc(ok);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % OBJECT_ALIGN, 0);
            heap.dealloc(ptr, ok);

            let too_strict = Layout::from_size_align(64, 64).unwrap();
            assert!(heap.alloc(too_strict).is_null());
        });
    }

    #[test]
    fn test_global_realloc() {
        with_heap(|heap| unsafe {
            let layout = Layout::from_size_align(16, 8).unwrap();
            let ptr = heap.alloc(layout);
            ptr.write_bytes(0x11, 16);

            let grown = heap.realloc(ptr, layout, 1000);
            assert!(!grown.is_null());
            assert_eq!(*grown.add(15), 0x11);
            assert_eq!(
                heap.usable_size(NonNull::new(grown).unwrap()),
                Ok(crate::SizeClass::Bytes1024.capacity())
            );
            heap.dealloc(grown, Layout::from_size_align(1000, 8).unwrap());
        });
    }

    #[test]
    fn test_oversized_request() {
        with_heap(|heap| unsafe {
            let layout = Layout::from_size_align(1 << 20, 8).unwrap();
            assert!(heap.alloc(layout).is_null());
            assert_eq!(heap.allocate(1 << 20), Err(AllocError::InvalidParam));
        });
    }

    #[test]
    fn test_try_free_through_lock() {
        with_heap(|heap| {
            let ptr = heap.allocate(40).unwrap();
            heap.try_free(ptr).unwrap();
            assert_eq!(heap.try_free(ptr), Err(AllocError::DoubleFree));
            heap.check().unwrap();
        });
    }
}
