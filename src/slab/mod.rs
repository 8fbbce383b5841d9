//! Slab allocator implementation.
//!
//! This module implements the kernel heap: size-classed slab caches with
//! empty/partial/full lists, guarded object headers and explicit recovery of
//! empty slabs.

pub mod object_header;
pub mod slab_cache;
pub mod slab_heap;
pub mod slab_node;

// Re-export public types
pub use object_header::{ObjectHeader, ALLOC_MAGIC, FREE_MAGIC, HEADER_SIZE};
pub use slab_cache::{SlabCache, SlabPageSource};
#[cfg(feature = "tracking")]
pub use slab_heap::HeapStats;
pub use slab_heap::{SizeClass, SlabHeap, DEFAULT_HEAP_RANGES, OBJECT_ALIGN};
