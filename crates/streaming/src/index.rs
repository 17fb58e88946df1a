//! Range-indexed enumeration of record files.
//!
//! Given a key hash range, find every record file under a node's record tree
//! whose hash falls in the range, without opening files and without visiting
//! subtrees that lie entirely outside it.
//!
//! # Algorithm
//!
//! 1. A wrapped range is split into its two plain segments, each indexed on
//!    its own.
//! 2. For a segment `[lo, hi]`, walk down from the root. At each level the
//!    sorted child names are binary-searched for the components of `lo` and
//!    `hi` at that depth.
//! 3. Children strictly between the two components lie wholly inside the
//!    segment and are collected by a plain recursive walk. The child equal to
//!    `lo`'s component (or `hi`'s) is on an edge path and is descended into,
//!    still bounded on that side.
//! 4. At the record level the file names are the full hashes and are compared
//!    directly, so exact-boundary records are included.
//!
//! Collected paths are written to temporary index files, one per segment,
//! instead of being held in memory.

use crate::error::Result;
use corelib::KeyHashRange;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use storage::disk::prune_empty_dirs;
use storage::layout::{component, COMPONENT_WIDTH, DIR_DEPTH};
use tempfile::NamedTempFile;
use tracing::debug;

/// Records found for one plain segment of a range.
#[derive(Debug)]
struct SegmentIndex {
    file: NamedTempFile,
    count: usize,
}

/// The result of indexing a range: one index file per segment.
///
/// Index files hold one record path per line, relative to the record root,
/// and are deleted when the index is dropped.
#[derive(Debug)]
pub struct RangeIndex {
    root: PathBuf,
    range: KeyHashRange,
    segments: Vec<SegmentIndex>,
}

impl RangeIndex {
    pub fn range(&self) -> KeyHashRange {
        self.range
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of records found.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index files, in segment order.
    pub fn index_files(&self) -> impl Iterator<Item = &Path> {
        self.segments.iter().map(|s| s.file.path())
    }

    /// Read all record paths back from the index files.
    pub fn paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(self.len());
        for segment in &self.segments {
            let reader = BufReader::new(segment.file.reopen()?);
            for line in reader.lines() {
                paths.push(self.root.join(line?));
            }
        }
        Ok(paths)
    }

    /// Delete every indexed record file from the source tree.
    ///
    /// Only call this once the records are safely stored elsewhere.
    pub fn delete_sources(&self) -> Result<usize> {
        let mut deleted = 0;
        for path in self.paths()? {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    prune_empty_dirs(&self.root, &path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}

/// Builds `RangeIndex`es over one record tree.
#[derive(Clone, Debug)]
pub struct RangeIndexer {
    root: PathBuf,
    scratch: PathBuf,
}

impl RangeIndexer {
    /// Index records under `root`, writing index files into `scratch`.
    pub fn new(root: impl Into<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch: scratch.into(),
        }
    }

    pub fn index(&self, range: &KeyHashRange) -> Result<RangeIndex> {
        fs::create_dir_all(&self.scratch)?;
        let mut segments = Vec::with_capacity(2);
        for segment in range.segments() {
            let file = NamedTempFile::new_in(&self.scratch)?;
            let mut walk = SegmentWalk {
                root: &self.root,
                lo: segment.start.to_hex(),
                hi: segment.end.to_hex(),
                out: BufWriter::new(file.reopen()?),
                count: 0,
            };
            if self.root.is_dir() {
                walk.walk(&self.root, 0, true, true)?;
            }
            walk.out.flush()?;
            let count = walk.count;
            debug!(segment = %segment, records = count, "indexed range segment");
            segments.push(SegmentIndex { file, count });
        }
        Ok(RangeIndex {
            root: self.root.clone(),
            range: *range,
            segments,
        })
    }
}

struct SegmentWalk<'a> {
    root: &'a Path,
    lo: String,
    hi: String,
    out: BufWriter<File>,
    count: usize,
}

impl SegmentWalk<'_> {
    /// Visit `dir` at `depth`, bounded below by `lo` when `on_lo` and above
    /// by `hi` when `on_hi`.
    fn walk(&mut self, dir: &Path, depth: usize, on_lo: bool, on_hi: bool) -> Result<()> {
        if !on_lo && !on_hi {
            return self.collect_all(dir, depth);
        }
        let children = sorted_children(dir)?;
        let (lo_key, hi_key) = if depth == DIR_DEPTH {
            (self.lo.clone(), self.hi.clone())
        } else {
            (
                component(&self.lo, depth).to_string(),
                component(&self.hi, depth).to_string(),
            )
        };
        let from = if on_lo {
            children.partition_point(|c| c.as_str() < lo_key.as_str())
        } else {
            0
        };
        let to = if on_hi {
            children.partition_point(|c| c.as_str() <= hi_key.as_str())
        } else {
            children.len()
        };
        for name in children.get(from..to).unwrap_or_default() {
            let path = dir.join(name);
            if depth == DIR_DEPTH {
                if is_record_name(name) && path.is_file() {
                    self.record(&path)?;
                }
                continue;
            }
            if !is_component_name(name) || !path.is_dir() {
                continue;
            }
            let child_on_lo = on_lo && *name == lo_key;
            let child_on_hi = on_hi && *name == hi_key;
            self.walk(&path, depth + 1, child_on_lo, child_on_hi)?;
        }
        Ok(())
    }

    /// Collect every record below `dir` without further range checks.
    fn collect_all(&mut self, dir: &Path, depth: usize) -> Result<()> {
        for name in sorted_children(dir)? {
            let path = dir.join(&name);
            if depth == DIR_DEPTH {
                if is_record_name(&name) && path.is_file() {
                    self.record(&path)?;
                }
            } else if is_component_name(&name) && path.is_dir() {
                self.collect_all(&path, depth + 1)?;
            }
        }
        Ok(())
    }

    fn record(&mut self, path: &Path) -> Result<()> {
        let relative = path.strip_prefix(self.root).unwrap_or(path);
        writeln!(self.out, "{}", relative.display())?;
        self.count += 1;
        Ok(())
    }
}

fn sorted_children(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(name) = entry?.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort_unstable();
    Ok(names)
}

fn is_lower_hex(name: &str) -> bool {
    name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_component_name(name: &str) -> bool {
    name.len() == COMPONENT_WIDTH && is_lower_hex(name)
}

fn is_record_name(name: &str) -> bool {
    name.len() == corelib::hash::HASH_KEY_HEX_LEN && is_lower_hex(name)
}
