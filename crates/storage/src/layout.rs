//! On-disk layout of record files.
//!
//! The record for key hash `H` (32 hex characters) lives at
//!
//! ```text
//! root/H[0..2]/H[2..4]/.../H[28..30]/H
//! ```
//!
//! i.e. fifteen directory levels named by successive 2-character slices of
//! the hash, and a file named by the full hash. Sorting directory names at
//! any level sorts the records below them by hash, which is what lets the
//! range indexer prune whole subtrees.

use crate::error::{Result, StorageError};
use corelib::hash::{HashKey, HASH_KEY_HEX_LEN};
use std::path::{Path, PathBuf};

/// Hex characters per path component.
pub const COMPONENT_WIDTH: usize = 2;

/// Number of directory levels above a record file.
pub const DIR_DEPTH: usize = HASH_KEY_HEX_LEN / COMPONENT_WIDTH - 1;

/// The path component of `hex` at directory level `depth`.
#[inline]
pub fn component(hex: &str, depth: usize) -> &str {
    &hex[depth * COMPONENT_WIDTH..(depth + 1) * COMPONENT_WIDTH]
}

/// Directory holding the record for `hash`.
pub fn record_dir(root: &Path, hash: HashKey) -> PathBuf {
    let hex = hash.to_hex();
    let mut path = root.to_path_buf();
    for depth in 0..DIR_DEPTH {
        path.push(component(&hex, depth));
    }
    path
}

/// Full path of the record file for `hash`.
pub fn record_path(root: &Path, hash: HashKey) -> PathBuf {
    record_dir(root, hash).join(hash.to_hex())
}

/// Recover the key hash from a record file's name.
pub fn hash_from_path(path: &Path) -> Result<HashKey> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::NotARecord(path.display().to_string()))?;
    name.parse::<HashKey>()
        .map_err(|_| StorageError::NotARecord(path.display().to_string()))
}
