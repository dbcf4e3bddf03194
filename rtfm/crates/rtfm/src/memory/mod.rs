//! Memory Module - Tagged Locations and Raw Copies
//!
//! Thin wrappers around the raw byte copies used to snapshot and restore
//! logged regions.
//!
//! # Safety
//!
//! The copy functions are `unsafe` because they operate on raw addresses.
//! The caller must ensure that:
//! - Both regions are valid for `size` bytes
//! - The regions do not overlap

pub mod location;

pub use location::TaggedMemoryLocation;

use std::ptr::{self, NonNull};

/// Copy the current bytes of `location` into `copy`
///
/// # Safety
///
/// - `location` must be valid for reads of its size
/// - `copy` must be valid for writes of the same size
#[inline]
pub unsafe fn snapshot(location: TaggedMemoryLocation, copy: NonNull<u8>) {
    ptr::copy_nonoverlapping(location.as_ptr() as *const u8, copy.as_ptr(), location.size());
}

/// Write the bytes held in `copy` back over `location`
///
/// # Safety
///
/// - `location` must be valid for writes of its size
/// - `copy` must be valid for reads of the same size
#[inline]
pub unsafe fn restore(location: TaggedMemoryLocation, copy: NonNull<u8>) {
    ptr::copy_nonoverlapping(copy.as_ptr() as *const u8, location.as_ptr(), location.size());
}
