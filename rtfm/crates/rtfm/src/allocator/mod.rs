//! Allocator Module - Undo Copy Storage
//!
//! Every logged write needs a buffer holding the bytes it overwrote. Those
//! buffers come from a per-transaction [`BumpAllocator`]:
//!
//! - **Small copies**: bumped out of fixed-size pages (`RuntimeConfig::page_size`)
//! - **Large copies**: one dedicated page per copy
//! - **Nested commit**: the child's pages move to the parent without copying

pub mod bump;

pub use bump::{BumpAllocator, COPY_ALIGNMENT};
