//! Slab cache implementation for a single size class.
//!
//! This module implements SlabCache which manages three lists (empty, partial, full)
//! of slab nodes for a specific size class.

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::slab_heap::SizeClass;
use super::slab_node::{SlabNode, SlotState, SLAB_HEADER_SIZE};
use crate::{AllocError, AllocResult};

/// Source of backing pages for new slabs.
pub trait SlabPageSource {
    /// Obtain `num_pages` contiguous, mapped pages.
    fn alloc_pages(&mut self, num_pages: usize) -> AllocResult<usize>;
    /// Hand the pages of a retired slab back.
    ///
    /// On error the pages stay mapped and still belong to the slab.
    fn dealloc_pages(&mut self, pos: usize, num_pages: usize) -> AllocResult;
}

struct SlabIntrusiveList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl SlabIntrusiveList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn back(&self) -> Option<usize> {
        self.tail
    }

    pub fn push_back(&mut self, size_class: SizeClass, slab_base: usize) {
        let mut node = SlabNode::new(slab_base, size_class);
        node.set_prev(self.tail);
        node.set_next(None);

        if let Some(tail) = self.tail {
            let mut tail_node = SlabNode::new(tail, size_class);
            tail_node.set_next(Some(slab_base));
        } else {
            self.head = Some(slab_base);
        }

        self.tail = Some(slab_base);
        self.len += 1;
    }

    pub fn pop_back(&mut self, size_class: SizeClass) -> Option<usize> {
        let tail = self.tail?;
        self.remove(size_class, tail);
        Some(tail)
    }

    pub fn remove(&mut self, size_class: SizeClass, slab_base: usize) {
        let mut node = SlabNode::new(slab_base, size_class);
        let prev = node.prev();
        let next = node.next();

        if let Some(prev_base) = prev {
            let mut prev_node = SlabNode::new(prev_base, size_class);
            prev_node.set_next(next);
        } else {
            self.head = next;
        }

        if let Some(next_base) = next {
            let mut next_node = SlabNode::new(next_base, size_class);
            next_node.set_prev(prev);
        } else {
            self.tail = prev;
        }

        node.set_prev(None);
        node.set_next(None);
        self.len = self.len.saturating_sub(1);
    }

    /// Walk the list front to back.
    pub fn try_for_each(
        &self,
        size_class: SizeClass,
        mut f: impl FnMut(SlabNode) -> AllocResult,
    ) -> AllocResult {
        let mut cursor = self.head;
        let mut visited = 0;
        while let Some(base) = cursor {
            if visited >= self.len {
                error!("slab list for {:?}: cycle or stale link at {:#x}", size_class, base);
                return Err(AllocError::Corrupted);
            }
            let node = SlabNode::new(base, size_class);
            if !node.is_valid_for_size_class() {
                return Err(AllocError::Corrupted);
            }
            f(node)?;
            cursor = node.next();
            visited += 1;
        }
        Ok(())
    }
}

/// Slab cache for a specific size class
pub struct SlabCache {
    size_class: SizeClass,
    empty: SlabIntrusiveList,
    partial: SlabIntrusiveList,
    full: SlabIntrusiveList,
}

impl SlabCache {
    pub const fn new(size_class: SizeClass) -> Self {
        Self {
            size_class,
            empty: SlabIntrusiveList::new(),
            partial: SlabIntrusiveList::new(),
            full: SlabIntrusiveList::new(),
        }
    }

    /// Forget every slab. Their pages must already be gone.
    pub fn reset(&mut self) {
        *self = Self::new(self.size_class);
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    /// Number of slabs currently owned by this cache.
    pub fn slab_count(&self) -> usize {
        self.empty.len() + self.partial.len() + self.full.len()
    }

    pub fn empty_slabs(&self) -> usize {
        self.empty.len()
    }

    /// Allocate an object from this cache
    /// Returns (slot_addr, slot_index)
    pub fn alloc_object(
        &mut self,
        pages: &mut dyn SlabPageSource,
        page_size: usize,
    ) -> AllocResult<(usize, usize)> {
        // 1. Try to allocate from partial list
        if let Some(slab_base) = self.partial.back() {
            let mut node = self.checked_node(slab_base)?;
            let (idx, slot_addr) = node.alloc_object()?.ok_or(AllocError::Corrupted)?;
            if node.is_full() {
                self.partial.remove(self.size_class, slab_base);
                self.full.push_back(self.size_class, slab_base);
            }
            return Ok((slot_addr, idx));
        }

        // 2. Try to allocate from empty list
        let slab_base = match self.empty.pop_back(self.size_class) {
            Some(slab_base) => slab_base,
            // 3. Carve a new slab from fresh pages
            None => self.allocate_new_slab(pages, page_size)?,
        };

        let mut node = self.checked_node(slab_base)?;
        let (idx, slot_addr) = node.alloc_object()?.ok_or(AllocError::Corrupted)?;
        if node.is_full() {
            self.full.push_back(self.size_class, slab_base);
        } else {
            self.partial.push_back(self.size_class, slab_base);
        }
        Ok((slot_addr, idx))
    }

    /// Map pages for a new slab and thread its slots. The slab is not on any list yet.
    fn allocate_new_slab(
        &mut self,
        pages: &mut dyn SlabPageSource,
        page_size: usize,
    ) -> AllocResult<usize> {
        let page_count = SlabNode::pages_for(self.size_class, page_size);
        let start_addr = pages.alloc_pages(page_count)?;

        let mut node = SlabNode::new(start_addr, self.size_class);
        node.init(page_count, page_size);
        debug!(
            "slab cache {:?}: new slab {:#x} ({} pages, {} objects)",
            self.size_class,
            start_addr,
            page_count,
            node.object_count()
        );
        Ok(start_addr)
    }

    /// Deallocate the object in slot `slot_index` of the slab containing `slot_addr`.
    ///
    /// A slab that becomes empty moves to the empty list and keeps its pages
    /// until [`recover`](Self::recover).
    pub fn dealloc_object(&mut self, slot_addr: usize, slot_index: usize) -> AllocResult {
        let slab_base = slot_addr
            .checked_sub(SLAB_HEADER_SIZE + slot_index * self.size_class.size())
            .ok_or(AllocError::Corrupted)?;
        let mut node = self.checked_node(slab_base)?;
        if node.object_index_from_addr(slot_addr) != Some(slot_index) {
            error!(
                "slab cache {:?}: object {:#x} does not match slot {} of slab {:#x}",
                self.size_class, slot_addr, slot_index, slab_base
            );
            return Err(AllocError::Corrupted);
        }

        let was_full = node.is_full();
        node.dealloc_object(slot_index);

        if node.is_empty() {
            if was_full {
                self.full.remove(self.size_class, slab_base);
            } else {
                self.partial.remove(self.size_class, slab_base);
            }
            self.empty.push_back(self.size_class, slab_base);
        } else if was_full {
            self.full.remove(self.size_class, slab_base);
            self.partial.push_back(self.size_class, slab_base);
        }
        Ok(())
    }

    /// Return every empty slab's pages to `pages`.
    /// Returns the number of pages released.
    ///
    /// A slab whose pages `pages` refuses stays on the empty list, intact.
    pub fn recover(&mut self, pages: &mut dyn SlabPageSource) -> usize {
        let mut released = 0;
        while let Some(slab_base) = self.empty.pop_back(self.size_class) {
            let mut node = SlabNode::new(slab_base, self.size_class);
            let page_count = node.page_count();
            node.retire();
            if let Err(_e) = pages.dealloc_pages(slab_base, page_count) {
                node.revive();
                self.empty.push_back(self.size_class, slab_base);
                warn!(
                    "slab cache {:?}: keeping empty slab {:#x}, pages not released: {:?}",
                    self.size_class, slab_base, _e
                );
                break;
            }
            released += page_count;
        }
        released
    }

    /// Verify every slab and every live object of this cache.
    pub fn check(&self) -> AllocResult {
        let size_class = self.size_class;
        let verify = move |expect: fn(&SlabNode) -> bool| {
            move |node: SlabNode| -> AllocResult {
                let mut live = 0;
                for idx in 0..node.object_count() {
                    match node.slot_state(idx) {
                        Ok(SlotState::Live(_)) => live += 1,
                        Ok(SlotState::Free) => {}
                        Err(e) => {
                            error!(
                                "slab cache {:?}: slot {} of slab {:#x} is damaged (overrun?)",
                                size_class, idx, node.addr
                            );
                            return Err(e);
                        }
                    }
                }
                if live != node.in_use() || !expect(&node) {
                    error!(
                        "slab cache {:?}: slab {:#x} accounting mismatch ({} live, {} recorded)",
                        size_class,
                        node.addr,
                        live,
                        node.in_use()
                    );
                    return Err(AllocError::Corrupted);
                }
                Ok(())
            }
        };

        self.empty.try_for_each(size_class, verify(SlabNode::is_empty))?;
        self.partial
            .try_for_each(size_class, verify(|n| !n.is_empty() && !n.is_full()))?;
        self.full.try_for_each(size_class, verify(SlabNode::is_full))
    }

    /// Live objects across all slabs.
    #[cfg(feature = "tracking")]
    pub fn objects_in_use(&self) -> AllocResult<usize> {
        let mut count = 0;
        for list in [&self.partial, &self.full] {
            list.try_for_each(self.size_class, |node| {
                count += node.in_use();
                Ok(())
            })?;
        }
        Ok(count)
    }

    fn checked_node(&self, slab_base: usize) -> AllocResult<SlabNode> {
        let node = SlabNode::new(slab_base, self.size_class);
        if !node.is_valid_for_size_class() {
            error!(
                "slab cache {:?}: invalid slab header at {:#x}",
                self.size_class, slab_base
            );
            return Err(AllocError::Corrupted);
        }
        Ok(node)
    }
}
