//! Object header and slot guards.
//!
//! Every slot starts with a 16-byte record. While the slot is allocated it is
//! an [`ObjectHeader`]; while the slot is free it is a [`FreeSlot`] link of
//! the slab's free list. Both share the `magic` word at offset 0, so a free
//! can tell a live object, an already freed one and garbage apart.

use core::mem::size_of;

use super::slab_heap::SizeClass;

/// Magic of an allocated object (header and tail guard).
pub const ALLOC_MAGIC: u32 = 0x1337_cafe;
/// Magic of a slot sitting on a slab free list.
pub const FREE_MAGIC: u32 = 0xb00b_1e55;
/// Value of the guard word at the end of an allocated slot.
pub const TAIL_MAGIC: usize = ALLOC_MAGIC as usize;

/// Size of the header in front of every returned object.
pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();
/// Size of the guard word at the end of every slot.
pub const TAIL_GUARD_SIZE: usize = size_of::<usize>();

/// Header stored immediately before every object returned by the heap.
///
/// The layout is fixed: any code freeing a heap pointer relies on it.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// [`ALLOC_MAGIC`] while the object is live.
    pub magic: u32,
    /// Index of the owning size class.
    pub size_class: u16,
    /// Slot index inside the owning slab.
    pub slot: u16,
    /// Size originally requested by the caller.
    pub requested: usize,
}

/// Free-list link written over the header of a free slot.
#[repr(C)]
pub(crate) struct FreeSlot {
    pub magic: u32,
    pub slot: u16,
    _reserved: u16,
    /// Address of the next free slot, or 0.
    pub next: usize,
}

const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(size_of::<FreeSlot>() <= HEADER_SIZE);

impl ObjectHeader {
    pub const fn new(size_class: SizeClass, slot: u16, requested: usize) -> Self {
        Self {
            magic: ALLOC_MAGIC,
            size_class: size_class.to_index() as u16,
            slot,
            requested,
        }
    }

    pub fn is_live(&self) -> bool {
        self.magic == ALLOC_MAGIC
    }

    pub fn is_free(&self) -> bool {
        self.magic == FREE_MAGIC
    }
}

/// Write the header and tail guard of a freshly allocated slot.
///
/// # Safety
///
/// `slot_addr` must be the start of a mapped slot of `header.size_class`.
pub(crate) unsafe fn stamp(slot_addr: usize, slot_size: usize, header: ObjectHeader) {
    unsafe {
        (slot_addr as *mut ObjectHeader).write(header);
        tail_guard_ptr(slot_addr, slot_size).write(TAIL_MAGIC);
    }
}

/// # Safety
///
/// `slot_addr` must point into mapped heap memory, 16-byte aligned.
pub(crate) unsafe fn read_header(slot_addr: usize) -> ObjectHeader {
    unsafe { (slot_addr as *const ObjectHeader).read() }
}

/// # Safety
///
/// `slot_addr` must be the start of a live slot.
pub(crate) unsafe fn set_requested(slot_addr: usize, requested: usize) {
    unsafe { (*(slot_addr as *mut ObjectHeader)).requested = requested };
}

/// # Safety
///
/// `slot_addr .. slot_addr + slot_size` must be mapped heap memory.
pub(crate) unsafe fn tail_guard_intact(slot_addr: usize, slot_size: usize) -> bool {
    unsafe { tail_guard_ptr(slot_addr, slot_size).read() == TAIL_MAGIC }
}

fn tail_guard_ptr(slot_addr: usize, slot_size: usize) -> *mut usize {
    (slot_addr + slot_size - TAIL_GUARD_SIZE) as *mut usize
}

impl FreeSlot {
    pub const fn new(slot: u16, next: usize) -> Self {
        Self {
            magic: FREE_MAGIC,
            slot,
            _reserved: 0,
            next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of};

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(align_of::<ObjectHeader>(), 16);
        assert_eq!(offset_of!(ObjectHeader, magic), 0);
        assert_eq!(offset_of!(ObjectHeader, size_class), 4);
        assert_eq!(offset_of!(ObjectHeader, slot), 6);
        assert_eq!(offset_of!(ObjectHeader, requested), 8);
        assert_eq!(offset_of!(FreeSlot, magic), 0);
    }

    #[test]
    fn test_stamp_and_guards() {
        #[repr(C, align(16))]
        struct Slot([u8; 64]);

        let mut slot = Slot([0; 64]);
        let addr = slot.0.as_mut_ptr() as usize;

        let header = ObjectHeader::new(SizeClass::Bytes64, 3, 40);
        unsafe { stamp(addr, 64, header) };
        let read = unsafe { read_header(addr) };
        assert_eq!(read, header);
        assert!(read.is_live());
        assert_eq!(read.size_class, SizeClass::Bytes64.to_index() as u16);
        assert!(unsafe { tail_guard_intact(addr, 64) });

        // Overrun by a single byte past the usable area.
        unsafe { *((addr + 64 - TAIL_GUARD_SIZE) as *mut u8) = 0xff };
        assert!(!unsafe { tail_guard_intact(addr, 64) });

        unsafe { (addr as *mut FreeSlot).write(FreeSlot::new(3, 0)) };
        assert!(unsafe { read_header(addr) }.is_free());
    }
}
