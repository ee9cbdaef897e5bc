//! In-memory index of cached entries
//!
//! The index is the authoritative record of what is cached. It is not
//! synchronized on its own; the service keeps it behind a single lock.

use ctcache_content_store::CacheHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Usage metadata of one cached hash
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Number of accesses, 1 for the insertion itself
    pub hits: u64,
    /// Time of first insertion, never changed afterwards
    pub insert_time: f64,
    /// Time of the latest hit
    pub access_time: f64,
}

impl CacheEntry {
    /// A freshly inserted entry
    pub fn new(now: f64) -> Self {
        Self {
            hits: 1,
            insert_time: now,
            access_time: now,
        }
    }

    fn touch(&mut self, now: f64) {
        self.access_time = now;
        self.hits = self.hits.saturating_add(1);
    }
}

/// Mapping from hash to entry metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheIndex {
    entries: HashMap<CacheHash, CacheEntry>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a hit on `hash` if present and returns the updated entry.
    ///
    /// This is the only place hit accounting happens.
    pub fn lookup_and_touch(&mut self, hash: &CacheHash, now: f64) -> Option<CacheEntry> {
        self.entries.get_mut(hash).map(|entry| {
            entry.touch(now);
            *entry
        })
    }

    /// Inserts a new entry, or records a hit if `hash` is already present
    pub fn insert_or_touch(&mut self, hash: CacheHash, now: f64) -> CacheEntry {
        *self
            .entries
            .entry(hash)
            .and_modify(|entry| entry.touch(now))
            .or_insert_with(|| CacheEntry::new(now))
    }

    /// Inserts an entry as-is, replacing any previous one
    pub fn insert(&mut self, hash: CacheHash, entry: CacheEntry) {
        self.entries.insert(hash, entry);
    }

    pub fn remove(&mut self, hash: &CacheHash) -> Option<CacheEntry> {
        self.entries.remove(hash)
    }

    /// Entry for `hash` without recording a hit
    pub fn get(&self, hash: &CacheHash) -> Option<&CacheEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &CacheHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// True if `id` is the string form of an indexed hash
    pub fn contains_id(&self, id: &str) -> bool {
        CacheHash::parse(id).is_ok_and(|hash| self.entries.contains_key(&hash))
    }

    pub fn all(&self) -> impl Iterator<Item = (&CacheHash, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(CacheHash, CacheEntry)> for CacheIndex {
    fn from_iter<I: IntoIterator<Item = (CacheHash, CacheEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(c: char) -> CacheHash {
        CacheHash::parse(&c.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn test_insert_creates_entry_with_one_hit() {
        let mut index = CacheIndex::new();
        let entry = index.insert_or_touch(hash('a'), 100.0);

        assert_eq!(entry, CacheEntry { hits: 1, insert_time: 100.0, access_time: 100.0 });
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_insert_existing_touches() {
        let mut index = CacheIndex::new();
        index.insert_or_touch(hash('a'), 100.0);
        let entry = index.insert_or_touch(hash('a'), 150.0);

        assert_eq!(entry.hits, 2);
        assert_eq!(entry.insert_time, 100.0);
        assert_eq!(entry.access_time, 150.0);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_lookup_miss_does_not_insert() {
        let mut index = CacheIndex::new();
        assert!(index.lookup_and_touch(&hash('b'), 10.0).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_repeated_lookups_count_hits() {
        let mut index = CacheIndex::new();
        index.insert_or_touch(hash('c'), 0.0);

        let mut last_access = 0.0;
        for n in 1..=5u64 {
            let entry = index.lookup_and_touch(&hash('c'), n as f64 * 10.0).unwrap();
            assert_eq!(entry.hits, n + 1);
            assert!(entry.access_time >= last_access);
            last_access = entry.access_time;
        }
        assert_eq!(index.get(&hash('c')).unwrap().insert_time, 0.0);
    }

    #[test]
    fn test_hits_saturate() {
        let mut index = CacheIndex::new();
        index.insert(hash('a'), CacheEntry { hits: u64::MAX, insert_time: 1.0, access_time: 1.0 });

        let entry = index.lookup_and_touch(&hash('a'), 2.0).unwrap();
        assert_eq!((entry.hits, entry.access_time), (u64::MAX, 2.0));
        assert_eq!(index.insert_or_touch(hash('a'), 3.0).hits, u64::MAX);
    }

    #[test]
    fn test_contains_id() {
        let mut index = CacheIndex::new();
        index.insert_or_touch(hash('d'), 0.0);

        assert!(index.contains_id(&"d".repeat(40)));
        assert!(!index.contains_id(&"e".repeat(40)));
        assert!(!index.contains_id("stray.txt"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut index: CacheIndex = [
            (hash('a'), CacheEntry::new(1.0)),
            (hash('b'), CacheEntry::new(2.0)),
        ]
        .into_iter()
        .collect();

        assert_eq!(index.remove(&hash('a')).unwrap().insert_time, 1.0);
        assert!(index.remove(&hash('a')).is_none());
        assert!(index.contains(&hash('b')));

        index.clear();
        assert!(index.is_empty());
    }
}
