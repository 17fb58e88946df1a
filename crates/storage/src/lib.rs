//! Per-node record storage.
//!
//! Records live on disk in a directory tree derived from their key hash and
//! are fronted by a bounded in-memory cache:
//! - `layout`: where a record for a given hash lives
//! - `disk`: reading and writing record files
//! - `strategy`: cache eviction policies (FIFO, LRU, LFU)
//! - `cache`: the bounded cache itself
//! - `store`: write-through cache over the disk store

pub mod cache;
pub mod disk;
pub mod error;
pub mod layout;
pub mod store;
pub mod strategy;

pub use cache::{Cache, CacheConfig};
pub use disk::{DiskStore, PutOutcome};
pub use error::{Result, StorageError};
pub use store::Store;
pub use strategy::CacheStrategy;
