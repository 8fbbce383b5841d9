//! Page-mapping collaborator of the slab heap.
//!
//! The heap never touches page tables itself. It asks a [`PageMapper`] to back
//! individual virtual pages inside `[heap_base, heap_end)` and to drop them
//! again during recovery.

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::{AllocError, AllocResult};

/// Backing-memory provider for a heap.
///
/// All methods are called with the heap lock held, possibly with interrupts
/// disabled, so implementations must not block or sleep.
pub trait PageMapper {
    /// First address the heap may grow into (page aligned).
    fn heap_base(&self) -> usize;

    /// One past the last address the heap may grow into (page aligned).
    fn heap_end(&self) -> usize;

    /// Back the page at `vaddr` with fresh memory.
    fn map_page(&mut self, vaddr: usize) -> AllocResult;

    /// Release the page at `vaddr`.
    fn unmap_page(&mut self, vaddr: usize);

    /// Release every page this mapper backed for the heap.
    fn unmap_all(&mut self);
}

/// Mapper over a region that is already backed by memory.
///
/// Suits early-boot heaps carved from identity-mapped RAM, where "mapping" a
/// page only means handing it to the heap. An optional page budget caps how
/// much of the region can be in use at once.
pub struct RegionMapper<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    start: usize,
    end: usize,
    page_limit: Option<usize>,
    mapped_pages: usize,
}

/// Fill pattern written over pages handed back by the heap.
const POISON_BYTE: u8 = 0xdb;

impl<const PAGE_SIZE: usize> RegionMapper<PAGE_SIZE> {
    /// Create a mapper for `[start, start + size)`.
    ///
    /// The bounds are shrunk inwards to page boundaries.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable memory that nothing else uses for
    /// as long as a heap built on this mapper is alive.
    pub const unsafe fn new(start: usize, size: usize) -> Self {
        Self {
            start: crate::align_up(start, PAGE_SIZE),
            end: (start + size) & !(PAGE_SIZE - 1),
            page_limit: None,
            mapped_pages: 0,
        }
    }

    /// Allow at most `pages` pages to be mapped at the same time.
    pub const fn with_page_limit(mut self, pages: usize) -> Self {
        self.page_limit = Some(pages);
        self
    }

    pub fn set_page_limit(&mut self, pages: Option<usize>) {
        self.page_limit = pages;
    }

    /// Number of pages currently handed out.
    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages
    }

    pub fn total_pages(&self) -> usize {
        self.end.saturating_sub(self.start) / PAGE_SIZE
    }
}

impl<const PAGE_SIZE: usize> PageMapper for RegionMapper<PAGE_SIZE> {
    fn heap_base(&self) -> usize {
        self.start
    }

    fn heap_end(&self) -> usize {
        self.end.max(self.start)
    }

    fn map_page(&mut self, vaddr: usize) -> AllocResult {
        if !crate::is_aligned(vaddr, PAGE_SIZE) || vaddr < self.start || vaddr >= self.end {
            warn!(
                "region mapper: page {:#x} outside [{:#x}, {:#x})",
                vaddr, self.start, self.end
            );
            return Err(AllocError::InvalidParam);
        }
        if let Some(limit) = self.page_limit {
            if self.mapped_pages >= limit {
                debug!("region mapper: page budget of {} exhausted", limit);
                return Err(AllocError::NoMemory);
            }
        }
        self.mapped_pages += 1;
        Ok(())
    }

    fn unmap_page(&mut self, vaddr: usize) {
        if vaddr < self.start || vaddr >= self.end {
            warn!("region mapper: unmap of foreign page {:#x}", vaddr);
            return;
        }
        // SAFETY: the page lies inside the region the caller vouched for and
        // the heap no longer uses it.
        unsafe { core::ptr::write_bytes(vaddr as *mut u8, POISON_BYTE, PAGE_SIZE) };
        self.mapped_pages = self.mapped_pages.saturating_sub(1);
    }

    fn unmap_all(&mut self) {
        self.mapped_pages = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, dealloc};
    use core::alloc::Layout;

    const PAGE_SIZE: usize = 0x1000;

    #[test]
    fn test_region_bounds_are_page_aligned() {
        let mapper = unsafe { RegionMapper::<PAGE_SIZE>::new(0x1234, 0x5000) };
        assert_eq!(mapper.heap_base(), 0x2000);
        assert_eq!(mapper.heap_end(), 0x6000);
        assert_eq!(mapper.total_pages(), 4);
    }

    #[test]
    fn test_page_limit() {
        let layout = Layout::from_size_align(4 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc(layout) } as usize;
        assert_ne!(base, 0);

        let mut mapper =
            unsafe { RegionMapper::<PAGE_SIZE>::new(base, 4 * PAGE_SIZE) }.with_page_limit(2);
        mapper.map_page(base).unwrap();
        mapper.map_page(base + PAGE_SIZE).unwrap();
        assert_eq!(mapper.map_page(base + 2 * PAGE_SIZE), Err(AllocError::NoMemory));
        assert_eq!(
            mapper.map_page(base + 4 * PAGE_SIZE),
            Err(AllocError::InvalidParam)
        );

        mapper.unmap_page(base);
        assert_eq!(mapper.mapped_pages(), 1);
        assert_eq!(unsafe { *(base as *const u8) }, POISON_BYTE);
        mapper.map_page(base + 2 * PAGE_SIZE).unwrap();

        mapper.unmap_all();
        assert_eq!(mapper.mapped_pages(), 0);

        unsafe { dealloc(base as *mut u8, layout) };
    }
}
