//! Allocator Submodule - Bump Allocation of Undo Copies
//!
//! Undo copies are carved out of owned pages by bumping an offset. Nothing is
//! freed individually; pages go away when the owning transaction resets or
//! drops, or move to the parent allocator on a nested commit.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment of every copy buffer
pub const COPY_ALIGNMENT: usize = 8;

/// One owned arena page
struct Page {
    ptr: NonNull<u8>,
    capacity: usize,
    used: usize,
}

impl Page {
    fn new(capacity: usize) -> Self {
        let layout = Self::layout(capacity);
        // SAFETY: capacity is never zero, so the layout has a nonzero size
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self {
            ptr,
            capacity,
            used: 0,
        }
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::from_size_align(capacity.max(1), COPY_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => crate::fatal!("bump page of {} bytes has no valid layout", capacity),
        }
    }

    #[inline]
    fn try_bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let offset = align_up(self.used, COPY_ALIGNMENT);
        let new_used = offset.checked_add(size)?;
        if new_used > self.capacity {
            return None;
        }
        self.used = new_used;
        // SAFETY: offset + size lies within the page
        Some(unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) })
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: ptr came from alloc::alloc with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.capacity)) };
    }
}

/// BumpAllocator - page arena for "before" copies
///
/// Requests larger than a page get a dedicated page of their own.
pub struct BumpAllocator {
    pages: Vec<Page>,
    large_pages: Vec<Page>,
    page_size: usize,
    allocation_count: usize,
    allocated_bytes: usize,
}

impl BumpAllocator {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            large_pages: Vec::new(),
            page_size: page_size.max(COPY_ALIGNMENT),
            allocation_count: 0,
            allocated_bytes: 0,
        }
    }

    /// Hand out a buffer of `size` bytes, valid until reset or drop
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        if size == 0 {
            return NonNull::dangling();
        }

        self.allocation_count += 1;
        self.allocated_bytes += size;

        if size > self.page_size {
            let mut page = Page::new(size);
            let ptr = page.try_bump(size);
            self.large_pages.push(page);
            return match ptr {
                Some(ptr) => ptr,
                None => crate::fatal!("dedicated page cannot hold {} bytes", size),
            };
        }

        if let Some(ptr) = self.pages.last_mut().and_then(|page| page.try_bump(size)) {
            return ptr;
        }

        let mut page = Page::new(self.page_size);
        let ptr = page.try_bump(size);
        self.pages.push(page);
        match ptr {
            Some(ptr) => ptr,
            None => crate::fatal!("fresh page cannot hold {} bytes", size),
        }
    }

    /// Take ownership of every page of `other`, leaving it empty
    ///
    /// Buffers handed out by `other` stay valid and now live as long as `self`.
    pub fn merge_from(&mut self, other: &mut BumpAllocator) {
        if self.pages.is_empty() {
            std::mem::swap(&mut self.pages, &mut other.pages);
        } else {
            self.pages.append(&mut other.pages);
        }
        self.large_pages.append(&mut other.large_pages);

        self.allocation_count += other.allocation_count;
        self.allocated_bytes += other.allocated_bytes;
        other.allocation_count = 0;
        other.allocated_bytes = 0;
    }

    /// Drop every buffer, keeping one page for reuse
    pub fn reset(&mut self) {
        self.pages.truncate(1);
        if let Some(page) = self.pages.first_mut() {
            page.used = 0;
        }
        self.large_pages.clear();
        self.allocation_count = 0;
        self.allocated_bytes = 0;
    }

    /// Number of buffers handed out since the last reset
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    /// Bytes handed out since the last reset
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn page_count(&self) -> usize {
        self.pages.len() + self.large_pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl std::fmt::Debug for BumpAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BumpAllocator")
            .field("pages", &self.pages.len())
            .field("large_pages", &self.large_pages.len())
            .field("allocation_count", &self.allocation_count)
            .field("allocated_bytes", &self.allocated_bytes)
            .finish()
    }
}

#[inline]
fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
