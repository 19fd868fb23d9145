//! Partition addressing and the per-partition read/write handles.
//!
//! ## Design Overview
//!
//! A store is a directory tree.  Caller metadata is folded through the
//! ordered catalog partitions into a directory (the *partition*), and the
//! file partition picks a *bucket* file inside it for each key:
//!
//! ```text
//! <root>/<catalog segment 1>/.../<catalog segment n>/<bucket>
//! <root>/<catalog segment 1>/.../<catalog segment n>/__indexes__/<bucket>
//! <root>/<catalog segment 1>/.../<catalog segment n>/__merge__/<bucket>
//! ```
//!
//! Addressing is pure: the same metadata always names the same directory,
//! and the same `(key, metadata)` always names the same bucket.  Segments
//! are sanitized to be filesystem-safe; an empty segment or a reserved
//! name is a configuration error.
//!
//! The handles operating on one partition live in submodules:
//! [`builder`], [`merge`], and [`accessor`].

pub mod accessor;
pub mod builder;
pub mod merge;
mod writers;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheError, FileAccessorCache};
use crate::codec::{CodecError, TMP_SUFFIX};
use crate::compaction::{CompactionError, MergeFunction};
use crate::index::{self, INDEX_DIR, IndexCache, IndexError, IndexOptions};
use crate::utils::{WorkerPanicked, remove_dir_if_exists, remove_file_if_exists, run_parallel};
use crate::{StoreKey, StoreMeta, StoreValue};

/// Name of the per-partition folder staging merge-builder inputs.
pub const MERGE_DIR: &str = "__merge__";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced by partition operations.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// A partition function produced an unusable path segment.
    #[error("invalid partition scheme: {0}")]
    InvalidScheme(String),

    /// The operation is not allowed in the handle's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WorkerPanicked> for PartitionError {
    fn from(_: WorkerPanicked) -> Self {
        PartitionError::Internal("partition worker panicked".into())
    }
}

// ------------------------------------------------------------------------------------------------
// Partition functions
// ------------------------------------------------------------------------------------------------

/// One level of the catalog: a name and a `metadata -> segment` function.
pub struct CatalogPartition<M> {
    name: String,
    extract: Arc<dyn Fn(&M) -> String + Send + Sync>,
}

impl<M> CatalogPartition<M> {
    pub fn new(
        name: impl Into<String>,
        extract: impl Fn(&M) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            extract: Arc::new(extract),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<M> Clone for CatalogPartition<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<M> fmt::Debug for CatalogPartition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogPartition").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Bucket selection: a name and a `(key, metadata) -> file name` function.
pub struct FilePartition<K, M> {
    name: String,
    select: Arc<dyn Fn(&K, &M) -> String + Send + Sync>,
}

impl<K, M> FilePartition<K, M> {
    pub fn new(
        name: impl Into<String>,
        select: impl Fn(&K, &M) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            select: Arc::new(select),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<K, M> Clone for FilePartition<K, M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            select: Arc::clone(&self.select),
        }
    }
}

impl<K, M> fmt::Debug for FilePartition<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePartition").field("name", &self.name).finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Addressing
// ------------------------------------------------------------------------------------------------

/// Make `raw` usable as a single path component.
///
/// Path separators, characters reserved on common filesystems, and control
/// characters become `_`; surrounding whitespace is trimmed.  Fails when
/// nothing usable remains, or the result is `.`, `..`, or a name the store
/// reserves for itself.
pub fn sanitize_segment(raw: &str, partition: &str) -> Result<String, PartitionError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        return Err(PartitionError::InvalidScheme(format!(
            "partition '{partition}' produced an empty segment"
        )));
    }
    if cleaned == "." || cleaned == ".." {
        return Err(PartitionError::InvalidScheme(format!(
            "partition '{partition}' produced the relative segment '{cleaned}'"
        )));
    }
    if cleaned == INDEX_DIR || cleaned == MERGE_DIR || cleaned.ends_with(TMP_SUFFIX) {
        return Err(PartitionError::InvalidScheme(format!(
            "partition '{partition}' produced the reserved name '{cleaned}'"
        )));
    }
    Ok(cleaned)
}

/// Root folder plus the functions mapping metadata and keys onto it.
pub struct PartitionScheme<K, M> {
    root: PathBuf,
    catalog: Vec<CatalogPartition<M>>,
    file: FilePartition<K, M>,
}

impl<K, M> PartitionScheme<K, M> {
    pub fn new(
        root: impl Into<PathBuf>,
        catalog: Vec<CatalogPartition<M>>,
        file: FilePartition<K, M>,
    ) -> Self {
        Self {
            root: root.into(),
            catalog,
            file,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the partition identified by `meta`.
    pub fn catalog_path(&self, meta: &M) -> Result<PathBuf, PartitionError> {
        let mut path = self.root.clone();
        for level in &self.catalog {
            path.push(sanitize_segment(&(level.extract)(meta), &level.name)?);
        }
        Ok(path)
    }

    /// File name of the bucket holding `key` within `meta`'s partition.
    pub fn bucket_name(&self, key: &K, meta: &M) -> Result<String, PartitionError> {
        sanitize_segment(&(self.file.select)(key, meta), &self.file.name)
    }
}

impl<K, M> fmt::Debug for PartitionScheme<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionScheme")
            .field("root", &self.root)
            .field("catalog", &self.catalog)
            .field("file", &self.file)
            .finish()
    }
}

/// Bucket files of a partition, sorted by name.
///
/// Directories (the index and merge folders) and temp files are skipped.
/// A missing partition has no buckets.
pub fn list_buckets(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut buckets = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TMP_SUFFIX));
        if !is_tmp {
            buckets.push(path);
        }
    }
    buckets.sort();
    Ok(buckets)
}

// ------------------------------------------------------------------------------------------------
// Shared context
// ------------------------------------------------------------------------------------------------

/// Everything a partition handle needs, shared by the store and every
/// handle it creates.
pub(crate) struct PartitionContext<K, I, V, M> {
    pub(crate) scheme: PartitionScheme<K, M>,
    pub(crate) merge: MergeFunction<I, V>,
    pub(crate) index: IndexOptions,
    pub(crate) parallelism: usize,
    pub(crate) files: Arc<FileAccessorCache>,
    pub(crate) indexes: IndexCache<K>,
}

impl<K, I, V, M> PartitionContext<K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    /// Path of the bucket holding `key` within `dir`.
    pub(crate) fn bucket_path(
        &self,
        dir: &Path,
        key: &K,
        meta: &M,
    ) -> Result<PathBuf, PartitionError> {
        Ok(dir.join(self.scheme.bucket_name(key, meta)?))
    }

    /// Group `keys` by the bucket of `dir` they map to.  Each group is
    /// sorted and deduplicated.
    pub(crate) fn group_keys(
        &self,
        dir: &Path,
        meta: &M,
        keys: &[K],
    ) -> Result<BTreeMap<PathBuf, Vec<K>>, PartitionError> {
        let mut groups: BTreeMap<PathBuf, Vec<K>> = BTreeMap::new();
        for key in keys {
            groups
                .entry(self.bucket_path(dir, key, meta)?)
                .or_default()
                .push(key.clone());
        }
        for group in groups.values_mut() {
            group.sort();
            group.dedup();
        }
        Ok(groups)
    }

    /// Regenerate the index of every bucket in `dir`.
    ///
    /// Index files whose bucket no longer exists are removed.  Returns the
    /// total number of samples written; 0 when indexing is disabled.
    pub(crate) fn rebuild_indexes(&self, dir: &Path) -> Result<usize, PartitionError> {
        if !self.index.enabled {
            debug!(path = %dir.display(), "indexing disabled, rebuild skipped");
            return Ok(0);
        }
        let buckets = list_buckets(dir)?;
        let strategy = self.index.strategy;
        let per_bucket = run_parallel(buckets.clone(), self.parallelism, |bucket| {
            index::builder::rebuild_bucket(&self.files, &self.indexes, strategy, &bucket)
                .map_err(PartitionError::from)
        })?;

        for orphan in list_buckets(&dir.join(INDEX_DIR))? {
            let has_bucket = orphan
                .file_name()
                .is_some_and(|name| buckets.iter().any(|b| b.file_name() == Some(name)));
            if !has_bucket {
                let _guard = self.files.lock_exclusive(&orphan)?;
                remove_file_if_exists(&orphan)?;
            }
        }

        let samples: usize = per_bucket.into_iter().sum();
        info!(path = %dir.display(), buckets = buckets.len(), samples, "partition reindexed");
        Ok(samples)
    }

    /// Delete the partition directory `dir` with all its buckets and
    /// indexes, and forget everything cached under it.
    ///
    /// Each bucket is taken exclusively before it is unlinked, so in-flight
    /// lookups finish first.  Returns whether the directory existed.
    pub(crate) fn remove_tree(&self, dir: &Path) -> Result<bool, PartitionError> {
        for bucket in list_buckets(dir)? {
            let _guard = self.files.lock_exclusive(&bucket)?;
            remove_file_if_exists(&bucket)?;
        }
        let removed = remove_dir_if_exists(dir)?;
        self.files.invalidate_dir(dir)?;
        self.indexes.invalidate_dir(dir)?;
        if removed {
            info!(path = %dir.display(), "partition removed");
        }
        Ok(removed)
    }
}
