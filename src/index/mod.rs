//! Sparse secondary index over compacted bucket files.
//!
//! ## Design Overview
//!
//! A compacted bucket holds one record per key in strictly ascending key
//! order.  Its sparse index is a small sample of `(key, offset)` pairs
//! taken from that file, stored next to it:
//!
//! ```text
//! <partition>/<bucket>                 # compacted records
//! <partition>/__indexes__/<bucket>     # [u32 len][key][u64 offset] ...
//! ```
//!
//! A lookup binary-searches the samples for the largest key ≤ the query
//! ([`SparseIndex::lower_bound`]) and the caller scans forward from the
//! returned offset.  The offset is only a safe starting point: every key
//! between it and the query's true position is ≤ the query, so a forward
//! scan never has to move backwards.
//!
//! Two sampling strategies exist ([`IndexStrategy`]), see
//! [`builder`] for how each one picks samples.
//!
//! # Degradation
//!
//! A missing index file is a legal state.  Lookups then start at offset 0.
//!
//! # In-memory samples
//!
//! When [`IndexOptions::cache_in_memory`] is set, loaded sample arrays are
//! kept in an [`IndexCache`] keyed by bucket path.  Every path that
//! rewrites a bucket or its index removes the bucket's entry.

pub(crate) mod builder;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, FileAccessorCache};
use crate::codec::{CodecError, ReadOutcome, RecordCursor};
use crate::encoding::Decode;

/// Name of the per-partition folder holding index files.
pub const INDEX_DIR: &str = "__indexes__";

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// How samples are picked from a compacted bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStrategy {
    /// One sample every `n` records, starting with the first.
    Step(usize),

    /// `n` evenly spaced samples regardless of file size (every record
    /// when the bucket has fewer than `n`).
    AbsoluteCount(usize),
}

/// Sparse index settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Build and consult sparse indexes.
    ///
    /// Default: `true`.
    pub enabled: bool,

    /// Sampling strategy.
    ///
    /// Default: `AbsoluteCount(64)`. The parameter must be ≥ 1.
    pub strategy: IndexStrategy,

    /// Keep loaded sample arrays in memory.
    ///
    /// Default: `true`.
    pub cache_in_memory: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: IndexStrategy::AbsoluteCount(64),
            cache_in_memory: true,
        }
    }
}

impl IndexOptions {
    /// Options with indexing turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self.strategy {
            IndexStrategy::Step(0) => Err("index step must be >= 1".into()),
            IndexStrategy::AbsoluteCount(0) => Err("index sample count must be >= 1".into()),
            _ => Ok(()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while building or loading sparse indexes.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The bucket is not compacted: a key did not strictly follow its
    /// predecessor.
    #[error("bucket {} is not compacted (key out of order at offset {offset})", path.display())]
    NotCompacted { path: PathBuf, offset: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Samples
// ------------------------------------------------------------------------------------------------

/// One sample: a key and the offset of its compacted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry<K> {
    pub key: K,
    pub offset: u64,
}

/// Sorted sample array of one bucket.
#[derive(Debug, Clone)]
pub struct SparseIndex<K> {
    entries: Vec<IndexEntry<K>>,
}

impl<K: Ord> SparseIndex<K> {
    /// Build from samples in any order.
    ///
    /// Samples are sorted by key, and equal keys by offset.
    pub fn from_entries(mut entries: Vec<IndexEntry<K>>) -> Self {
        let sorted = entries
            .windows(2)
            .all(|w| (&w[0].key, w[0].offset) <= (&w[1].key, w[1].offset));
        if !sorted {
            entries.sort_by(|a, b| a.key.cmp(&b.key).then(a.offset.cmp(&b.offset)));
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[IndexEntry<K>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset from which a forward scan for `key` must start.
    ///
    /// The offset of the largest sample key ≤ `key`, the lowest such offset
    /// when that key was sampled more than once, or 0 when every sample
    /// key is greater than `key`.
    pub fn lower_bound(&self, key: &K) -> u64 {
        self.lower_bound_from(key, 0).1
    }

    /// Search `entries[from..]`, returning `(sample index, offset)`.
    fn lower_bound_from(&self, key: &K, from: usize) -> (usize, u64) {
        let tail = &self.entries[from.min(self.entries.len())..];
        let upper = from + tail.partition_point(|e| e.key <= *key);
        if upper == 0 {
            return (0, 0);
        }
        let found = &self.entries[upper - 1].key;
        let first = self.entries[..upper].partition_point(|e| e.key < *found);
        (first, self.entries[first].offset)
    }

    /// Start offsets for keys that all live in this bucket.
    ///
    /// `sorted_keys` must be ascending.  Each search starts where the
    /// previous one ended, so the whole batch walks the samples once.
    pub fn offsets_in_one_group(&self, sorted_keys: &[K]) -> Vec<u64> {
        let mut from = 0;
        sorted_keys
            .iter()
            .map(|key| {
                let (idx, offset) = self.lower_bound_from(key, from);
                from = idx;
                offset
            })
            .collect()
    }

    /// Start offsets for keys in any order, each searched on its own.
    pub fn offsets_independent(&self, keys: &[K]) -> Vec<u64> {
        keys.iter().map(|key| self.lower_bound(key)).collect()
    }
}

// ------------------------------------------------------------------------------------------------
// In-memory sample cache
// ------------------------------------------------------------------------------------------------

/// Loaded sample arrays keyed by bucket path.
#[derive(Debug)]
pub struct IndexCache<K> {
    entries: Mutex<HashMap<PathBuf, Arc<SparseIndex<K>>>>,
}

impl<K> Default for IndexCache<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> IndexCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, Arc<SparseIndex<K>>>>, IndexError> {
        self.entries
            .lock()
            .map_err(|_| IndexError::Internal("index cache poisoned".into()))
    }

    pub fn get(&self, bucket: &Path) -> Result<Option<Arc<SparseIndex<K>>>, IndexError> {
        Ok(self.entries()?.get(bucket).cloned())
    }

    pub fn insert(&self, bucket: &Path, index: Arc<SparseIndex<K>>) -> Result<(), IndexError> {
        self.entries()?.insert(bucket.to_path_buf(), index);
        Ok(())
    }

    pub fn invalidate(&self, bucket: &Path) -> Result<(), IndexError> {
        self.entries()?.remove(bucket);
        Ok(())
    }

    pub fn invalidate_dir(&self, dir: &Path) -> Result<(), IndexError> {
        self.entries()?.retain(|path, _| !path.starts_with(dir));
        Ok(())
    }

    pub fn clear(&self) -> Result<(), IndexError> {
        self.entries()?.clear();
        Ok(())
    }

    /// Number of cached sample arrays.
    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ------------------------------------------------------------------------------------------------
// Loading
// ------------------------------------------------------------------------------------------------

/// Path of the index file belonging to `bucket`.
pub fn index_path(bucket: &Path) -> PathBuf {
    let dir = bucket.parent().unwrap_or_else(|| Path::new(""));
    match bucket.file_name() {
        Some(name) => dir.join(INDEX_DIR).join(name),
        None => dir.join(INDEX_DIR),
    }
}

/// Read the index file of `bucket`, or `Ok(None)` if there is none.
///
/// Corrupt entries are skipped.
pub fn load<K: Decode + Ord>(
    files: &FileAccessorCache,
    bucket: &Path,
) -> Result<Option<SparseIndex<K>>, IndexError> {
    let path = index_path(bucket);
    let Some(lease) = files.acquire(&path)? else {
        return Ok(None);
    };

    let mut cursor = RecordCursor::new(lease.bytes());
    let mut entries = Vec::new();
    loop {
        match cursor.next_index_entry::<K>() {
            ReadOutcome::Record((key, offset)) => entries.push(IndexEntry { key, offset }),
            ReadOutcome::Corrupt { offset, error } => {
                warn!(path = %path.display(), offset, %error, "skipping corrupt index entry");
            }
            ReadOutcome::EndOfStream => break,
        }
    }
    if entries.is_empty() {
        return Ok(None);
    }
    debug!(path = %path.display(), samples = entries.len(), "sparse index loaded");
    Ok(Some(SparseIndex::from_entries(entries)))
}

/// Sample array for `bucket`, from memory or disk.
///
/// Must be called while holding a lease on `bucket`, so the index cannot
/// be replaced by a compaction between loading and caching it.
pub(crate) fn resolve<K: Decode + Ord>(
    files: &FileAccessorCache,
    cache: &IndexCache<K>,
    options: &IndexOptions,
    bucket: &Path,
) -> Result<Option<Arc<SparseIndex<K>>>, IndexError> {
    if !options.enabled {
        return Ok(None);
    }
    if options.cache_in_memory {
        if let Some(index) = cache.get(bucket)? {
            return Ok(Some(index));
        }
    }
    let Some(index) = load::<K>(files, bucket)? else {
        return Ok(None);
    };
    let index = Arc::new(index);
    if options.cache_in_memory {
        cache.insert(bucket, Arc::clone(&index))?;
    }
    Ok(Some(index))
}
