//! Write Log - Append-Only Undo Log
//!
//! Entries are stored in fixed-capacity buckets. A full bucket is never grown,
//! so an entry never moves once pushed.

use crate::memory::TaggedMemoryLocation;
use std::ptr::NonNull;

/// Entries per bucket
pub const BUCKET_CAPACITY: usize = 256;

/// One logged region and its "before" copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLogEntry {
    pub location: TaggedMemoryLocation,
    /// Buffer in the owning transaction's bump allocator
    pub copy: NonNull<u8>,
}

/// WriteLog - bucketed, append-only
#[derive(Debug, Default)]
pub struct WriteLog {
    buckets: Vec<Vec<WriteLogEntry>>,
    len: usize,
    total_bytes: usize,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: WriteLogEntry) {
        let needs_bucket = self
            .buckets
            .last()
            .map_or(true, |bucket| bucket.len() == BUCKET_CAPACITY);
        if needs_bucket {
            self.buckets.push(Vec::with_capacity(BUCKET_CAPACITY));
        }
        if let Some(bucket) = self.buckets.last_mut() {
            bucket.push(entry);
        }
        self.len += 1;
        self.total_bytes += entry.location.size();
    }

    /// Entries in insertion order; `.rev()` walks newest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &WriteLogEntry> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of the sizes of all logged regions
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every entry, keeping the first bucket
    pub fn clear(&mut self) {
        self.buckets.truncate(1);
        if let Some(bucket) = self.buckets.first_mut() {
            bucket.clear();
        }
        self.len = 0;
        self.total_bytes = 0;
    }
}
