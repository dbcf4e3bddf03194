//! Tagged Memory Location
//!
//! Address plus byte length, used as the dedup key of the hit set and as the
//! unit of undo in the write log.

use std::fmt;

/// TaggedMemoryLocation - address with an explicit length tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaggedMemoryLocation {
    address: usize,
    size: u16,
}

impl TaggedMemoryLocation {
    /// Largest length a single location can carry
    pub const MAX_SIZE: usize = u16::MAX as usize;

    /// Create a location
    ///
    /// A size above [`Self::MAX_SIZE`] means a caller skipped chunking and is
    /// fatal.
    pub fn new(address: usize, size: usize) -> Self {
        match Self::try_new(address, size) {
            Some(location) => location,
            None => crate::fatal!(
                "memory location {:#x} with size {} exceeds the tag width ({})",
                address,
                size,
                Self::MAX_SIZE
            ),
        }
    }

    /// Create a location, or `None` when `size` does not fit the tag
    pub fn try_new(address: usize, size: usize) -> Option<Self> {
        let size = u16::try_from(size).ok()?;
        Some(Self { address, size })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.address.wrapping_add(self.size as usize)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.address as *mut u8
    }

    /// Split `[address, address + size)` into tag-sized locations
    pub fn chunks(address: usize, size: usize) -> impl Iterator<Item = TaggedMemoryLocation> {
        (0..size)
            .step_by(Self::MAX_SIZE)
            .map(move |offset| TaggedMemoryLocation {
                address: address + offset,
                size: (size - offset).min(Self::MAX_SIZE) as u16,
            })
    }
}

impl fmt::Debug for TaggedMemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.address, self.size)
    }
}
