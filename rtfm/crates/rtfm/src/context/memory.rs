//! Closed Memory Helpers
//!
//! Stores, copies and allocations that record themselves in the current
//! transaction before touching memory.

use super::Context;
use crate::error::Transactional;
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

impl Context {
    /// Record then store `value` at `dst`
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes and aligned.
    pub unsafe fn write<T: Copy>(&mut self, dst: *mut T, value: T) -> Transactional<()> {
        self.record_write(dst as *const u8, std::mem::size_of::<T>())?;
        ptr::write(dst, value);
        Ok(())
    }

    /// Record then fill `count` bytes at `dst` with `byte`
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `count` bytes of writes.
    pub unsafe fn write_bytes(&mut self, dst: *mut u8, byte: u8, count: usize) -> Transactional<()> {
        self.record_write(dst, count)?;
        ptr::write_bytes(dst, byte, count);
        Ok(())
    }

    /// Record then copy `count` bytes between non-overlapping regions
    ///
    /// # Safety
    ///
    /// Same contract as [`std::ptr::copy_nonoverlapping`].
    pub unsafe fn copy_nonoverlapping(&mut self, src: *const u8, dst: *mut u8, count: usize) -> Transactional<()> {
        self.record_write(dst, count)?;
        ptr::copy_nonoverlapping(src, dst, count);
        Ok(())
    }

    /// Record then copy `count` bytes between possibly overlapping regions
    ///
    /// # Safety
    ///
    /// Same contract as [`std::ptr::copy`].
    pub unsafe fn copy(&mut self, src: *const u8, dst: *mut u8, count: usize) -> Transactional<()> {
        self.record_write(dst, count)?;
        ptr::copy(src, dst, count);
        Ok(())
    }

    /// Allocate memory that is released again if the transaction aborts
    pub fn alloc(&mut self, layout: Layout) -> Transactional<NonNull<u8>> {
        self.ensure_on_track()?;
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }

        // SAFETY: layout has a nonzero size
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        if self.is_closed() {
            self.did_allocate(ptr.as_ptr(), layout.size());
            let addr = ptr.as_ptr();
            // SAFETY: the allocation is only reachable through this transaction
            self.defer_until_abort(move || unsafe { alloc::dealloc(addr, layout) });
        }
        Ok(ptr)
    }

    /// Release memory once the transaction commits, or now outside one
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Context::alloc`] (or the global allocator) with
    /// the same `layout`, and must not be used after the release.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let addr = ptr.as_ptr();
        if self.is_closed() {
            self.defer_until_commit(move || unsafe { alloc::dealloc(addr, layout) });
        } else {
            alloc::dealloc(addr, layout);
        }
    }
}

fn dangling_for(layout: Layout) -> NonNull<u8> {
    // Alignment is a nonzero power of two
    NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling())
}
