//! Bounded in-memory record cache.

use crate::strategy::{CacheStrategy, EntryStats};
use corelib::{HashKey, KeyHashRange};
use std::collections::HashMap;

/// Cache sizing and eviction policy, as sent with `INIT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of cached records; `0` disables caching.
    pub capacity: usize,
    pub strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            strategy: CacheStrategy::default(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    stats: EntryStats,
}

/// Record cache keyed by hash, evicting per its `CacheStrategy`.
///
/// Eviction scans all entries, which keeps bookkeeping trivial; caches are
/// small relative to the record set they front.
#[derive(Debug)]
pub struct Cache {
    config: CacheConfig,
    entries: HashMap<HashKey, Entry>,
    clock: u64,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::with_capacity(config.capacity.min(4096)),
            clock: 0,
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, hash: HashKey) -> Option<Vec<u8>> {
        let now = self.tick();
        let entry = self.entries.get_mut(&hash)?;
        entry.stats.last_used = now;
        entry.stats.hits += 1;
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, hash: HashKey, value: Vec<u8>) {
        if self.config.capacity == 0 {
            return;
        }
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.value = value;
            entry.stats.last_used = now;
            entry.stats.hits += 1;
            return;
        }
        if self.entries.len() >= self.config.capacity {
            let victim = self
                .config
                .strategy
                .victim(self.entries.iter().map(|(k, e)| (k, &e.stats)))
                .copied();
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            hash,
            Entry {
                value,
                stats: EntryStats {
                    inserted: now,
                    last_used: now,
                    hits: 1,
                },
            },
        );
    }

    pub fn remove(&mut self, hash: HashKey) {
        self.entries.remove(&hash);
    }

    /// Drop every cached record whose hash falls in `range`.
    pub fn evict_range(&mut self, range: &KeyHashRange) -> usize {
        let before = self.entries.len();
        self.entries.retain(|hash, _| !range.contains(*hash));
        before - self.entries.len()
    }

    /// Replace sizing/policy, dropping all cached records.
    pub fn reconfigure(&mut self, config: CacheConfig) {
        self.config = config;
        self.entries.clear();
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, strategy: CacheStrategy) -> Cache {
        Cache::new(CacheConfig { capacity, strategy })
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut c = cache(2, CacheStrategy::Lru);
        c.insert(HashKey(1), b"a".to_vec());
        c.insert(HashKey(2), b"b".to_vec());
        c.get(HashKey(1));
        c.insert(HashKey(3), b"c".to_vec());
        assert!(c.get(HashKey(1)).is_some());
        assert!(c.get(HashKey(2)).is_none());
        assert!(c.get(HashKey(3)).is_some());
    }

    #[test]
    fn test_fifo_ignores_reads() {
        let mut c = cache(2, CacheStrategy::Fifo);
        c.insert(HashKey(1), b"a".to_vec());
        c.insert(HashKey(2), b"b".to_vec());
        c.get(HashKey(1));
        c.insert(HashKey(3), b"c".to_vec());
        assert!(c.get(HashKey(1)).is_none());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_lfu_keeps_hot_entries() {
        let mut c = cache(2, CacheStrategy::Lfu);
        c.insert(HashKey(1), b"a".to_vec());
        c.insert(HashKey(2), b"b".to_vec());
        c.get(HashKey(2));
        c.get(HashKey(2));
        c.get(HashKey(1));
        c.insert(HashKey(3), b"c".to_vec());
        assert!(c.get(HashKey(2)).is_some());
        assert!(c.get(HashKey(1)).is_none());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut c = cache(0, CacheStrategy::Lru);
        c.insert(HashKey(1), b"a".to_vec());
        assert!(c.is_empty());
    }

    #[test]
    fn test_evict_range() {
        let mut c = cache(10, CacheStrategy::Lru);
        for i in 0..5u128 {
            c.insert(HashKey(i * 10), vec![i as u8]);
        }
        let evicted = c.evict_range(&KeyHashRange::new(HashKey(10), HashKey(30)));
        assert_eq!(evicted, 3);
        assert_eq!(c.len(), 2);
    }
}
