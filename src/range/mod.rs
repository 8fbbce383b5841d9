//! Free-range tracking.
//!
//! This module implements a coalescing set of free `[start, start + length)`
//! intervals over any unsigned integer address space. It is used standalone
//! for physical pages, I/O ports and MMIO windows, and by the slab heap to
//! track which parts of its virtual range are free.
//!
//! The table behind a list is pluggable: [`InlineRanges`] never allocates,
//! and with the `alloc` feature [`GrowableRangeList`] has no fixed limit.

pub mod range_list;
pub mod shared;

// Re-export public types
#[cfg(feature = "alloc")]
pub use range_list::GrowableRangeList;
pub use range_list::{
    InlineRanges, Range, RangeAddr, RangeList, RangeStorage, DEFAULT_RANGE_CAPACITY,
};
pub use shared::SharedRangeList;
