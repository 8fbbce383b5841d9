//! Kernel Heap Allocator
//!
//! This crate implements the memory-allocation core of a monolithic kernel,
//! featuring:
//! - A coalescing free-range tracker for page, port and MMIO address spaces
//! - A slab heap allocator with size classes and explicit page recovery
//! - Guarded object headers for double-free and overrun detection
//! - An IRQ-safe locked heap usable as the global allocator

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Page size used when none is given
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size`, length or alignment. (e.g. zero-length range)
    InvalidParam,
    /// No enough memory (or address space) to allocate.
    NoMemory,
    /// Deallocate or reserve a region that is not owned by the allocator.
    NotAllocated,
    /// The object was already free when it was deallocated.
    DoubleFree,
    /// An object or slab guard value was overwritten.
    Corrupted,
}

impl AllocError {
    /// Whether the error means heap memory has already been damaged.
    ///
    /// Such errors cannot be handled locally and are escalated by the heap.
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            AllocError::NotAllocated | AllocError::DoubleFree | AllocError::Corrupted
        )
    }
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            AllocError::InvalidParam => "invalid parameter",
            AllocError::NoMemory => "out of memory",
            AllocError::NotAllocated => "address not allocated by this heap",
            AllocError::DoubleFree => "double free",
            AllocError::Corrupted => "heap corruption detected",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

// Export our allocator implementations
pub mod range;
#[cfg(feature = "alloc")]
pub use range::GrowableRangeList;
pub use range::{
    InlineRanges, Range, RangeAddr, RangeList, RangeStorage, SharedRangeList,
    DEFAULT_RANGE_CAPACITY,
};

pub mod mapper;
pub use mapper::{PageMapper, RegionMapper};

pub mod slab;
#[cfg(feature = "tracking")]
pub use slab::HeapStats;
pub use slab::{ObjectHeader, SizeClass, SlabHeap, DEFAULT_HEAP_RANGES};

pub mod global_allocator;
pub use global_allocator::LockedSlabHeap;
