//! Slab heap allocator implementation.
//!
//! This module implements the kernel heap: requests are rounded up to a size
//! class, served from per-class slab caches, and backed by pages obtained from
//! a [`PageMapper`]. Which parts of the heap's virtual range are in use is
//! tracked with a [`RangeList`] held inline in the heap.
//!
//! Free page ranges never touch each other, so a table of `HEAP_RANGES`
//! entries can describe any free set over `2 * HEAP_RANGES` pages. The heap
//! manages at most that many pages of its mapper's range, which means
//! handing pages back can never run out of table entries.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::object_header::{self, ObjectHeader, HEADER_SIZE, TAIL_GUARD_SIZE};
use super::slab_cache::{SlabCache, SlabPageSource};
use super::slab_node::SLAB_HEADER_SIZE;
use crate::mapper::PageMapper;
use crate::range::{InlineRanges, RangeList};
use crate::{AllocError, AllocResult};

/// Alignment guaranteed for every object returned by the heap.
pub const OBJECT_ALIGN: usize = 16;

/// Range table entries reserved for the heap's own page tracking.
pub const DEFAULT_HEAP_RANGES: usize = 1024;

/// Size classes for slab allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SizeClass {
    Bytes32 = 32,
    Bytes64 = 64,
    Bytes128 = 128,
    Bytes256 = 256,
    Bytes512 = 512,
    Bytes1024 = 1024,
    Bytes2048 = 2048,
    Bytes4096 = 4096,
    Bytes8192 = 8192,
    Bytes16384 = 16384,
    Bytes32768 = 32768,
    Bytes65536 = 65536,
}

impl SizeClass {
    pub const COUNT: usize = 12;
    const MIN_SHIFT: u32 = 5;
    const MAX_OBJ_SIZE: usize = 65536;

    /// Per-object overhead: header in front, guard word at the end.
    pub const OVERHEAD: usize = HEADER_SIZE + TAIL_GUARD_SIZE;

    /// Select the smallest class whose slots fit `size` bytes plus overhead
    pub fn from_size(size: usize) -> Option<Self> {
        let required_size = size.checked_add(Self::OVERHEAD)?;

        if required_size > Self::MAX_OBJ_SIZE {
            warn!("Invalid allocation size: {}", size);
            return None;
        }

        let shift = required_size
            .next_power_of_two()
            .trailing_zeros()
            .max(Self::MIN_SHIFT);
        Self::from_index((shift - Self::MIN_SHIFT) as usize)
    }

    /// Slot size in bytes
    pub const fn size(&self) -> usize {
        *self as usize
    }

    /// Bytes usable by the caller in one slot
    pub const fn capacity(&self) -> usize {
        self.size() - Self::OVERHEAD
    }

    pub const fn to_index(&self) -> usize {
        (self.size().trailing_zeros() - Self::MIN_SHIFT) as usize
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SizeClass::Bytes32),
            1 => Some(SizeClass::Bytes64),
            2 => Some(SizeClass::Bytes128),
            3 => Some(SizeClass::Bytes256),
            4 => Some(SizeClass::Bytes512),
            5 => Some(SizeClass::Bytes1024),
            6 => Some(SizeClass::Bytes2048),
            7 => Some(SizeClass::Bytes4096),
            8 => Some(SizeClass::Bytes8192),
            9 => Some(SizeClass::Bytes16384),
            10 => Some(SizeClass::Bytes32768),
            11 => Some(SizeClass::Bytes65536),
            _ => None,
        }
    }
}

/// Heap usage statistics
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub mapped_pages: usize,
    pub slabs: usize,
    pub objects_in_use: usize,
    pub requested_bytes: usize,
}

/// The heap's virtual range: which pages are free and how many are mapped.
struct HeapPages<M, const PAGE_SIZE: usize, const HEAP_RANGES: usize> {
    mapper: M,
    free: RangeList<usize, InlineRanges<usize, HEAP_RANGES>>,
    /// Managed part of the mapper's range, `[base, end)`.
    base: usize,
    end: usize,
    mapped_pages: usize,
}

impl<M: PageMapper, const PAGE_SIZE: usize, const HEAP_RANGES: usize>
    HeapPages<M, PAGE_SIZE, HEAP_RANGES>
{
    /// Most pages whose free set always fits the range table.
    const MAX_PAGES: usize = 2 * HEAP_RANGES;

    /// Forget every page and take over the mapper's range again.
    fn reset(&mut self) {
        let base = self.mapper.heap_base();
        let end = self.mapper.heap_end().max(base);
        let pages = (end - base) / PAGE_SIZE;
        let managed = pages.min(Self::MAX_PAGES);
        if managed < pages {
            warn!(
                "slab heap: range table covers {} of {} pages, ignoring [{:#x}, {:#x})",
                managed,
                pages,
                base + managed * PAGE_SIZE,
                end
            );
        }

        self.base = base;
        self.end = base + managed * PAGE_SIZE;
        self.mapped_pages = 0;
        self.free.clear();
        if managed == 0 {
            warn!("slab heap: empty heap range at {:#x}", base);
        } else if let Err(_e) = self.free.free(self.base, self.end - self.base) {
            error!(
                "slab heap: invalid heap range [{:#x}, {:#x}): {:?}",
                self.base, self.end, _e
            );
        }
    }

    /// Whether the page containing `addr` currently backs a slab.
    fn is_mapped(&self, addr: usize) -> bool {
        let page = addr & !(PAGE_SIZE - 1);
        addr >= self.base && addr < self.end && !self.free.contains(page, PAGE_SIZE)
    }

    fn managed_pages(&self) -> usize {
        (self.end - self.base) / PAGE_SIZE
    }

    fn free_pages(&self) -> usize {
        self.free.total_free() / PAGE_SIZE
    }
}

impl<M: PageMapper, const PAGE_SIZE: usize, const HEAP_RANGES: usize> SlabPageSource
    for HeapPages<M, PAGE_SIZE, HEAP_RANGES>
{
    fn alloc_pages(&mut self, num_pages: usize) -> AllocResult<usize> {
        let bytes = num_pages * PAGE_SIZE;
        let base = self.free.allocate(bytes).map_err(|e| {
            warn!("slab heap: no virtual space left for {} pages", num_pages);
            e
        })?;

        for i in 0..num_pages {
            if let Err(_e) = self.mapper.map_page(base + i * PAGE_SIZE) {
                warn!(
                    "slab heap: failed to map page {:#x}: {:?}",
                    base + i * PAGE_SIZE,
                    _e
                );
                for j in 0..i {
                    self.mapper.unmap_page(base + j * PAGE_SIZE);
                }
                // The range was just carved out, so merging it back needs no new entry.
                if let Err(_e) = self.free.free(base, bytes) {
                    error!("slab heap: lost virtual range {:#x} on rollback: {:?}", base, _e);
                }
                return Err(AllocError::NoMemory);
            }
        }

        self.mapped_pages += num_pages;
        Ok(base)
    }

    fn dealloc_pages(&mut self, pos: usize, num_pages: usize) -> AllocResult {
        let bytes = num_pages * PAGE_SIZE;
        // Pages stay mapped and owned by the slab unless the range is tracked again.
        self.free.free(pos, bytes).map_err(|e| {
            error!(
                "slab heap: cannot return [{:#x}, +{:#x}) to the free ranges: {:?}",
                pos, bytes, e
            );
            e
        })?;
        for i in 0..num_pages {
            self.mapper.unmap_page(pos + i * PAGE_SIZE);
        }
        self.mapped_pages = self.mapped_pages.saturating_sub(num_pages);
        Ok(())
    }
}

/// Report a corruption-class error and stop.
///
/// `context` names what was being touched, e.g. the object or the cache.
#[cold]
fn heap_corruption(err: AllocError, context: core::fmt::Arguments<'_>) -> ! {
    error!("slab heap: {} ({})", err, context);
    panic!("slab heap: {} ({})", err, context);
}

/// Slab heap over the virtual range supplied by `M`
///
/// At most `2 * HEAP_RANGES` pages of the mapper's range are used.
pub struct SlabHeap<
    M: PageMapper,
    const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE },
    const HEAP_RANGES: usize = DEFAULT_HEAP_RANGES,
> {
    caches: [SlabCache; SizeClass::COUNT],
    pages: HeapPages<M, PAGE_SIZE, HEAP_RANGES>,
    initialised: bool,
    vigilant: bool,
    #[cfg(feature = "tracking")]
    requested_bytes: usize,
}

impl<M: PageMapper, const PAGE_SIZE: usize, const HEAP_RANGES: usize>
    SlabHeap<M, PAGE_SIZE, HEAP_RANGES>
{
    pub const fn new(mapper: M) -> Self {
        Self {
            caches: [
                SlabCache::new(SizeClass::Bytes32),
                SlabCache::new(SizeClass::Bytes64),
                SlabCache::new(SizeClass::Bytes128),
                SlabCache::new(SizeClass::Bytes256),
                SlabCache::new(SizeClass::Bytes512),
                SlabCache::new(SizeClass::Bytes1024),
                SlabCache::new(SizeClass::Bytes2048),
                SlabCache::new(SizeClass::Bytes4096),
                SlabCache::new(SizeClass::Bytes8192),
                SlabCache::new(SizeClass::Bytes16384),
                SlabCache::new(SizeClass::Bytes32768),
                SlabCache::new(SizeClass::Bytes65536),
            ],
            pages: HeapPages {
                mapper,
                free: RangeList::new(),
                base: 0,
                end: 0,
                mapped_pages: 0,
            },
            initialised: false,
            vigilant: false,
            #[cfg(feature = "tracking")]
            requested_bytes: 0,
        }
    }

    /// Reset every size class and the page tracking to the empty state.
    ///
    /// Pages still mapped from an earlier life are dropped through
    /// [`PageMapper::unmap_all`]. Calling this on an empty heap does nothing
    /// beyond resetting bookkeeping. A mapper range longer than
    /// `2 * HEAP_RANGES` pages is cut to that length.
    pub fn initialise(&mut self) {
        if self.pages.mapped_pages > 0 {
            debug!(
                "slab heap: dropping {} mapped pages on re-initialise",
                self.pages.mapped_pages
            );
            self.pages.mapper.unmap_all();
        }

        for cache in &mut self.caches {
            cache.reset();
        }

        self.pages.reset();

        #[cfg(feature = "tracking")]
        {
            self.requested_bytes = 0;
        }
        self.initialised = true;
    }

    /// Allocate `size` bytes, aligned to [`OBJECT_ALIGN`].
    pub fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.ensure_initialised();
        self.run_vigilance_check();

        let size_class = SizeClass::from_size(size).ok_or(AllocError::InvalidParam)?;
        let cache = &mut self.caches[size_class.to_index()];
        let (slot_addr, slot) = match cache.alloc_object(&mut self.pages, PAGE_SIZE) {
            Ok(found) => found,
            Err(e) if e.is_corruption() => {
                heap_corruption(e, format_args!("{:?} cache", size_class))
            }
            Err(e) => {
                warn!("slab heap: allocation of {} bytes failed: {:?}", size, e);
                return Err(e);
            }
        };

        let header = ObjectHeader::new(size_class, slot as u16, size);
        // SAFETY: the cache just handed out this slot of a mapped slab.
        unsafe { object_header::stamp(slot_addr, size_class.size(), header) };

        #[cfg(feature = "tracking")]
        {
            self.requested_bytes += size;
        }

        // SAFETY: slot addresses are inside mapped heap pages and never 0.
        Ok(unsafe { NonNull::new_unchecked((slot_addr + HEADER_SIZE) as *mut u8) })
    }

    /// Free an object, stopping the kernel if its header does not check out.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        if let Err(e) = self.try_free(ptr) {
            heap_corruption(e, format_args!("object {:#x}", ptr.as_ptr() as usize));
        }
    }

    /// Free an object, reporting corruption instead of escalating it.
    ///
    /// On error nothing is modified.
    pub fn try_free(&mut self, ptr: NonNull<u8>) -> AllocResult {
        self.run_vigilance_check();

        let (size_class, slot_addr, header) = self.validate(ptr)?;
        self.caches[size_class.to_index()].dealloc_object(slot_addr, header.slot as usize)?;

        #[cfg(feature = "tracking")]
        {
            self.requested_bytes = self.requested_bytes.saturating_sub(header.requested);
        }
        Ok(())
    }

    /// Bytes the caller may use at `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> AllocResult<usize> {
        let (size_class, _, _) = self.validate(ptr)?;
        Ok(size_class.capacity())
    }

    /// Resize an object, in place when its slot is large enough.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> AllocResult<NonNull<u8>> {
        let (size_class, slot_addr, header) = match self.validate(ptr) {
            Ok(found) => found,
            Err(e) => heap_corruption(e, format_args!("object {:#x}", ptr.as_ptr() as usize)),
        };

        if new_size <= size_class.capacity() {
            // SAFETY: validate found a live header at slot_addr.
            unsafe { object_header::set_requested(slot_addr, new_size) };
            #[cfg(feature = "tracking")]
            {
                self.requested_bytes = self.requested_bytes - header.requested + new_size;
            }
            return Ok(ptr);
        }

        let new_ptr = self.allocate(new_size)?;
        // SAFETY: both objects are live and distinct; neither is shorter than the copy.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                header.requested.min(new_size),
            );
        }
        self.free(ptr);
        Ok(new_ptr)
    }

    /// Unmap the pages of every empty slab.
    /// Returns the number of pages released.
    ///
    /// Every released page is tracked as free again before it is unmapped.
    pub fn recovery(&mut self) -> usize {
        let mut released = 0;
        for cache in &mut self.caches {
            released += cache.recover(&mut self.pages);
        }
        if released > 0 {
            debug!(
                "slab heap: recovered {} pages, {} still mapped",
                released, self.pages.mapped_pages
            );
        }
        released
    }

    /// Pages currently backing the heap, including empty slabs not yet recovered.
    pub fn heap_page_count(&self) -> usize {
        self.pages.mapped_pages
    }

    /// Pages of the mapper's range this heap hands out.
    pub fn managed_pages(&self) -> usize {
        self.pages.managed_pages()
    }

    /// Managed pages not backing any slab.
    ///
    /// Always `managed_pages() - heap_page_count()`.
    pub fn free_pages(&self) -> usize {
        self.pages.free_pages()
    }

    /// Walk every slab and verify all slab headers, object headers and tail guards.
    pub fn check(&self) -> AllocResult {
        for cache in &self.caches {
            cache.check()?;
        }
        Ok(())
    }

    /// Run [`check`](Self::check) before every allocate and free.
    pub fn set_vigilant(&mut self, vigilant: bool) {
        self.vigilant = vigilant;
    }

    pub fn is_vigilant(&self) -> bool {
        self.vigilant
    }

    pub fn mapper(&self) -> &M {
        &self.pages.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut M {
        &mut self.pages.mapper
    }

    /// Get heap statistics
    ///
    /// Fails with `Corrupted` if a slab list cannot be walked.
    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> AllocResult<HeapStats> {
        let mut objects_in_use = 0;
        for cache in &self.caches {
            objects_in_use += cache.objects_in_use()?;
        }
        Ok(HeapStats {
            mapped_pages: self.pages.mapped_pages,
            slabs: self.caches.iter().map(SlabCache::slab_count).sum(),
            objects_in_use,
            requested_bytes: self.requested_bytes,
        })
    }

    fn ensure_initialised(&mut self) {
        if !self.initialised {
            self.initialise();
        }
    }

    fn run_vigilance_check(&self) {
        if !self.vigilant {
            return;
        }
        for cache in &self.caches {
            if let Err(e) = cache.check() {
                heap_corruption(
                    e,
                    format_args!("{:?} cache, consistency check", cache.size_class()),
                );
            }
        }
    }

    /// Check the header in front of `ptr` and locate its slot.
    fn validate(&self, ptr: NonNull<u8>) -> AllocResult<(SizeClass, usize, ObjectHeader)> {
        let addr = ptr.as_ptr() as usize;
        if !self.initialised
            || !crate::is_aligned(addr, OBJECT_ALIGN)
            || addr < HEADER_SIZE
            || !self.pages.is_mapped(addr - HEADER_SIZE)
        {
            return Err(AllocError::NotAllocated);
        }

        let slot_addr = addr - HEADER_SIZE;
        // SAFETY: the header lies on a mapped heap page and is 16-byte aligned.
        let header = unsafe { object_header::read_header(slot_addr) };
        if header.is_free() {
            error!("slab heap: double free of {:#x}", addr);
            return Err(AllocError::DoubleFree);
        }
        if !header.is_live() {
            error!(
                "slab heap: bad magic {:#x} in front of {:#x}",
                header.magic, addr
            );
            return Err(AllocError::Corrupted);
        }

        let size_class =
            SizeClass::from_index(header.size_class as usize).ok_or(AllocError::Corrupted)?;
        let slab_base = (header.slot as usize)
            .checked_mul(size_class.size())
            .and_then(|offset| slot_addr.checked_sub(SLAB_HEADER_SIZE + offset))
            .ok_or(AllocError::Corrupted)?;
        let slot_end = slot_addr + size_class.size();
        if !self.pages.is_mapped(slab_base) || !self.pages.is_mapped(slot_end - 1) {
            error!(
                "slab heap: header of {:#x} points outside mapped slabs",
                addr
            );
            return Err(AllocError::Corrupted);
        }

        // SAFETY: the whole slot was just checked to be on mapped heap pages.
        if !unsafe { object_header::tail_guard_intact(slot_addr, size_class.size()) } {
            error!(
                "slab heap: overrun past {:#x} (+{} requested, {:?})",
                addr, header.requested, size_class
            );
            return Err(AllocError::Corrupted);
        }

        Ok((size_class, slot_addr, header))
    }
}
