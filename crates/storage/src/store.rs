//! Write-through record store: a cache in front of the disk tree.

use crate::cache::{Cache, CacheConfig};
use crate::disk::{DiskStore, PutOutcome};
use crate::error::Result;
use corelib::{HashKey, KeyHashRange};
use parking_lot::Mutex;
use std::path::Path;
use tracing::debug;

/// A node's records. Disk is authoritative; the cache only saves reads.
#[derive(Debug)]
pub struct Store {
    disk: DiskStore,
    cache: Mutex<Cache>,
}

impl Store {
    pub fn open(root: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        Ok(Self {
            disk: DiskStore::open(root.as_ref())?,
            cache: Mutex::new(Cache::new(config)),
        })
    }

    pub fn root(&self) -> &Path {
        self.disk.root()
    }

    pub fn reconfigure(&self, config: CacheConfig) {
        debug!(capacity = config.capacity, strategy = %config.strategy, "cache reconfigured");
        self.cache.lock().reconfigure(config);
    }

    pub fn put(&self, hash: HashKey, value: Vec<u8>) -> Result<PutOutcome> {
        let outcome = self.disk.put(hash, &value)?;
        self.cache.lock().insert(hash, value);
        Ok(outcome)
    }

    pub fn get(&self, hash: HashKey) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.cache.lock().get(hash) {
            return Ok(Some(value));
        }
        let value = self.disk.get(hash)?;
        if let Some(v) = &value {
            self.cache.lock().insert(hash, v.clone());
        }
        Ok(value)
    }

    pub fn delete(&self, hash: HashKey) -> Result<bool> {
        self.cache.lock().remove(hash);
        self.disk.delete(hash)
    }

    /// Forget cached copies of records that were migrated away.
    pub fn evict_range(&self, range: &KeyHashRange) -> usize {
        self.cache.lock().evict_range(range)
    }
}
