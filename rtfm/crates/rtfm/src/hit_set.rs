//! Hit Set - Already-Logged Regions
//!
//! Membership set answering "has this transaction already protected this
//! exact region". Never used for replay.

use crate::memory::TaggedMemoryLocation;
use rustc_hash::FxHashSet;

/// HitSet - set of tagged locations
#[derive(Debug, Default)]
pub struct HitSet {
    set: FxHashSet<TaggedMemoryLocation>,
}

impl HitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, returning `true` when it was not present yet
    #[inline]
    pub fn insert(&mut self, key: TaggedMemoryLocation) -> bool {
        self.set.insert(key)
    }

    #[inline]
    pub fn contains(&self, key: &TaggedMemoryLocation) -> bool {
        self.set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedMemoryLocation> {
        self.set.iter()
    }

    /// Remove every key, keeping the allocation
    pub fn clear(&mut self) {
        self.set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut hits = HitSet::new();
        let key = TaggedMemoryLocation::new(0x1000, 8);
        assert!(hits.insert(key));
        assert!(!hits.insert(key));
        assert_eq!(hits.len(), 1);
        assert!(hits.contains(&key));
    }

    #[test]
    fn test_key_includes_size() {
        let mut hits = HitSet::new();
        hits.insert(TaggedMemoryLocation::new(0x1000, 8));
        assert!(!hits.contains(&TaggedMemoryLocation::new(0x1000, 4)));
    }

    #[test]
    fn test_clear() {
        let mut hits = HitSet::new();
        hits.insert(TaggedMemoryLocation::new(0x1000, 8));
        hits.clear();
        assert!(hits.is_empty());
    }
}
