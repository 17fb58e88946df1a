//! Record files on disk.

use crate::error::Result;
use crate::layout;
use corelib::HashKey;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Whether a put created a record or replaced one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
}

/// Record files under a root directory, laid out by `layout`.
#[derive(Clone, Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (creating if needed) the record tree at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn put(&self, hash: HashKey, value: &[u8]) -> Result<PutOutcome> {
        let path = layout::record_path(&self.root, hash);
        let outcome = if path.exists() {
            PutOutcome::Updated
        } else {
            PutOutcome::Inserted
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, value)?;
        Ok(outcome)
    }

    pub fn get(&self, hash: HashKey) -> Result<Option<Vec<u8>>> {
        match fs::read(layout::record_path(&self.root, hash)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a record; returns `false` if there was nothing to delete.
    pub fn delete(&self, hash: HashKey) -> Result<bool> {
        let path = layout::record_path(&self.root, hash);
        match fs::remove_file(&path) {
            Ok(()) => {
                prune_empty_dirs(&self.root, &path);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove the now-empty directories above a deleted record, stopping at
/// `root` or at the first directory that still has entries.
pub fn prune_empty_dirs(root: &Path, removed: &Path) {
    let mut dir = removed.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}
