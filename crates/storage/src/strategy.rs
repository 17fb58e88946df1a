//! Cache eviction strategies.
//!
//! A strategy decides which cached record to drop when the cache is full.
//! Different strategies optimize for different access patterns:
//!
//! - **FIFO**: drop the record that was cached first
//! - **LRU**: drop the record that was read or written least recently
//! - **LFU**: drop the record with the fewest accesses (oldest on ties)
//!
//! The set of strategies is fixed, so this is a plain enum; `from_str` is the
//! factory mapping a configured name to a strategy.

use crate::error::StorageError;
use std::fmt;
use std::str::FromStr;

/// Bookkeeping a strategy needs about one cached entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryStats {
    /// Logical time the entry was first cached.
    pub inserted: u64,
    /// Logical time of the last access.
    pub last_used: u64,
    /// Number of accesses, including the insert.
    pub hits: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CacheStrategy {
    Fifo,
    #[default]
    Lru,
    Lfu,
}

impl CacheStrategy {
    /// Name used in configuration and on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            CacheStrategy::Fifo => "FIFO",
            CacheStrategy::Lru => "LRU",
            CacheStrategy::Lfu => "LFU",
        }
    }

    /// Eviction rank: the entry with the smallest rank is evicted first.
    pub fn rank(&self, stats: &EntryStats) -> (u64, u64) {
        match self {
            CacheStrategy::Fifo => (stats.inserted, 0),
            CacheStrategy::Lru => (stats.last_used, 0),
            CacheStrategy::Lfu => (stats.hits, stats.last_used),
        }
    }

    /// Pick the entry to evict among `(key, stats)` pairs.
    pub fn victim<'a, K, I>(&self, entries: I) -> Option<&'a K>
    where
        K: 'a,
        I: IntoIterator<Item = (&'a K, &'a EntryStats)>,
    {
        entries
            .into_iter()
            .min_by_key(|(_, stats)| self.rank(stats))
            .map(|(key, _)| key)
    }
}

impl FromStr for CacheStrategy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(CacheStrategy::Fifo),
            "LRU" => Ok(CacheStrategy::Lru),
            "LFU" => Ok(CacheStrategy::Lfu),
            _ => Err(StorageError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
