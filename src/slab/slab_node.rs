//! Slab node implementation.
//!
//! This module defines the SlabNode structure, a view over one slab in heap
//! memory: a fixed header followed by equal-size slots threaded on an
//! embedded free list.

#[cfg(feature = "log")]
use log::error;

use super::object_header::{self, FreeSlot, ObjectHeader, FREE_MAGIC};
pub use super::slab_heap::SizeClass;
use crate::{AllocError, AllocResult};

#[repr(C)]
pub(crate) struct SlabHeader {
    magic: u32,
    size_class: u16,
    object_count: u16,
    in_use: u16,
    _reserved: u16,
    page_count: u32,
    free_head: usize,
    prev: usize,
    next: usize,
}

const SLAB_HEADER_MAGIC: u32 = 0x534c_4142;
const RETIRED_MAGIC: u32 = 0xdead_51ab;

/// Bytes reserved at the start of every slab for its header.
pub const SLAB_HEADER_SIZE: usize = 64;

const _: () = assert!(core::mem::size_of::<SlabHeader>() <= SLAB_HEADER_SIZE);

/// What a slot of a slab currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Live(ObjectHeader),
}

#[derive(Debug, Clone, Copy)]
pub struct SlabNode {
    pub addr: usize,           // Starting virtual address of the slab
    pub size_class: SizeClass, // Size class
}

impl SlabNode {
    /// Minimum number of slots carved out of one slab.
    pub const MIN_OBJECTS: usize = 4;

    pub const fn new(addr: usize, size_class: SizeClass) -> Self {
        Self { addr, size_class }
    }

    /// Pages backing one slab of `size_class`.
    pub const fn pages_for(size_class: SizeClass, page_size: usize) -> usize {
        let bytes = SLAB_HEADER_SIZE + Self::MIN_OBJECTS * size_class.size();
        let pages = (bytes + page_size - 1) / page_size;
        if pages == 0 {
            1
        } else {
            pages
        }
    }

    fn object_base(&self) -> usize {
        self.addr + SLAB_HEADER_SIZE
    }

    fn header(&self) -> &SlabHeader {
        // SAFETY: a node is only built for the base of a mapped slab, which is
        // page aligned and starts with SLAB_HEADER_SIZE bytes reserved for the header.
        unsafe { &*(self.addr as *const SlabHeader) }
    }

    fn header_mut(&mut self) -> &mut SlabHeader {
        // SAFETY: as in `header`. The heap lock makes this the only live view.
        unsafe { &mut *(self.addr as *mut SlabHeader) }
    }

    /// Write a fresh header and thread every slot onto the free list.
    pub fn init(&mut self, page_count: usize, page_size: usize) {
        let slab_bytes = page_count * page_size;
        let object_size = self.size_class.size();
        let object_count =
            ((slab_bytes - SLAB_HEADER_SIZE) / object_size).min(u16::MAX as usize);

        // Link slots back to front so the list starts with slot 0.
        let mut next = 0;
        for idx in (0..object_count).rev() {
            let slot_addr = self.object_addr(idx);
            // SAFETY: idx < object_count, so the slot lies inside the slab's pages
            // and is aligned to the class size.
            unsafe { (slot_addr as *mut FreeSlot).write(FreeSlot::new(idx as u16, next)) };
            next = slot_addr;
        }

        let size_class = self.size_class.to_index() as u16;
        *self.header_mut() = SlabHeader {
            magic: SLAB_HEADER_MAGIC,
            size_class,
            object_count: object_count as u16,
            in_use: 0,
            _reserved: 0,
            page_count: page_count as u32,
            free_head: next,
            prev: 0,
            next: 0,
        };
    }

    /// Invalidate the header before the slab's pages are handed back.
    pub fn retire(&mut self) {
        self.header_mut().magic = RETIRED_MAGIC;
    }

    /// Undo [`retire`](Self::retire) when the pages could not be handed back.
    pub fn revive(&mut self) {
        self.header_mut().magic = SLAB_HEADER_MAGIC;
    }

    pub fn is_valid_for_size_class(&self) -> bool {
        let header = self.header();
        header.magic == SLAB_HEADER_MAGIC && header.size_class as usize == self.size_class.to_index()
    }

    pub fn object_count(&self) -> usize {
        self.header().object_count as usize
    }

    pub fn in_use(&self) -> usize {
        self.header().in_use as usize
    }

    pub fn page_count(&self) -> usize {
        self.header().page_count as usize
    }

    pub fn is_full(&self) -> bool {
        self.header().in_use == self.header().object_count
    }

    pub fn is_empty(&self) -> bool {
        self.header().in_use == 0
    }

    /// Pop a slot off the free list.
    ///
    /// Returns `(slot_index, slot_addr)`, `Ok(None)` when the slab is full, and
    /// `Corrupted` if the free list was overwritten.
    pub fn alloc_object(&mut self) -> AllocResult<Option<(usize, usize)>> {
        let slot_addr = self.header().free_head;
        if slot_addr == 0 {
            return Ok(None);
        }

        let Some(idx) = self.object_index_from_addr(slot_addr) else {
            error!(
                "slab {:#x}: free list points outside the slab ({:#x})",
                self.addr, slot_addr
            );
            return Err(AllocError::Corrupted);
        };

        // SAFETY: object_index_from_addr accepted slot_addr, so it is the start
        // of a slot inside this slab.
        let free = unsafe { &*(slot_addr as *const FreeSlot) };
        if free.magic != FREE_MAGIC || free.slot as usize != idx {
            error!(
                "slab {:#x}: free slot {} at {:#x} was written after free",
                self.addr, idx, slot_addr
            );
            return Err(AllocError::Corrupted);
        }
        let next = free.next;

        let header = self.header_mut();
        header.free_head = next;
        header.in_use += 1;
        Ok(Some((idx, slot_addr)))
    }

    /// Push slot `object_index` back onto the free list.
    ///
    /// The caller has already checked that the slot holds a live object.
    pub fn dealloc_object(&mut self, object_index: usize) {
        let slot_addr = self.object_addr(object_index);
        let head = self.header().free_head;
        // SAFETY: the caller validated object_index against this slab.
        unsafe { (slot_addr as *mut FreeSlot).write(FreeSlot::new(object_index as u16, head)) };

        let header = self.header_mut();
        header.free_head = slot_addr;
        header.in_use = header.in_use.saturating_sub(1);
    }

    pub fn object_addr(&self, object_index: usize) -> usize {
        self.object_base() + object_index * self.size_class.size()
    }

    pub fn object_index_from_addr(&self, obj_addr: usize) -> Option<usize> {
        let base = self.object_base();
        if obj_addr < base {
            return None;
        }

        let offset = obj_addr - base;
        if offset % self.size_class.size() != 0 {
            return None;
        }

        let object_index = offset / self.size_class.size();
        (object_index < self.object_count()).then_some(object_index)
    }

    /// Inspect slot `object_index`; `Corrupted` if it is neither free nor live.
    pub fn slot_state(&self, object_index: usize) -> AllocResult<SlotState> {
        let slot_addr = self.object_addr(object_index);
        // SAFETY: callers pass object_index < object_count, which keeps the
        // header and tail guard reads inside the slab.
        let header = unsafe { object_header::read_header(slot_addr) };
        if header.is_free() {
            return Ok(SlotState::Free);
        }
        if header.is_live()
            && header.size_class as usize == self.size_class.to_index()
            && header.slot as usize == object_index
            && unsafe { object_header::tail_guard_intact(slot_addr, self.size_class.size()) }
        {
            return Ok(SlotState::Live(header));
        }
        Err(AllocError::Corrupted)
    }

    pub fn prev(&self) -> Option<usize> {
        let prev = self.header().prev;
        if prev == 0 {
            None
        } else {
            Some(prev)
        }
    }

    pub fn next(&self) -> Option<usize> {
        let next = self.header().next;
        if next == 0 {
            None
        } else {
            Some(next)
        }
    }

    pub fn set_prev(&mut self, prev: Option<usize>) {
        self.header_mut().prev = prev.unwrap_or(0);
    }

    pub fn set_next(&mut self, next: Option<usize>) {
        self.header_mut().next = next.unwrap_or(0);
    }
}
