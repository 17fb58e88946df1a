//! Tests for the write-through record store.

use corelib::{HashKey, KeyHashRange};
use storage::{CacheConfig, CacheStrategy, PutOutcome, Store};

fn open(dir: &tempfile::TempDir, capacity: usize) -> Store {
    Store::open(
        dir.path(),
        CacheConfig {
            capacity,
            strategy: CacheStrategy::Lru,
        },
    )
    .unwrap()
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let hash = HashKey::of_key("persisted");
    {
        let store = open(&dir, 4);
        assert_eq!(store.put(hash, b"value".to_vec()).unwrap(), PutOutcome::Inserted);
    }
    let store = open(&dir, 4);
    assert_eq!(store.get(hash).unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_cache_never_serves_deleted_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, 4);
    let hash = HashKey::of_key("gone");
    store.put(hash, b"v".to_vec()).unwrap();
    assert!(store.get(hash).unwrap().is_some());
    assert!(store.delete(hash).unwrap());
    assert_eq!(store.get(hash).unwrap(), None);
}

#[test]
fn test_evicted_range_is_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, 4);
    let hash = HashKey::of_key("moved");
    store.put(hash, b"v".to_vec()).unwrap();

    // Once the file is gone and the cache evicted, the record is gone.
    std::fs::remove_file(storage::layout::record_path(store.root(), hash)).unwrap();
    assert_eq!(store.evict_range(&KeyHashRange::new(hash, hash)), 1);
    assert_eq!(store.get(hash).unwrap(), None);
}

#[test]
fn test_uncached_store_reads_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, 0);
    let hash = HashKey::of_key("k");
    store.put(hash, b"v".to_vec()).unwrap();
    assert_eq!(store.get(hash).unwrap(), Some(b"v".to_vec()));
}
