//! # Compaction Module
//!
//! Turns a bucket of input records into a compacted bucket: one record per
//! key, keys strictly ascending.
//!
//! ## Plain compaction
//!
//! [`compress_bucket`] reads every `(key, input)` record of a bucket
//! produced by the builder, groups inputs by key in append order, applies
//! the merge function once per key, and writes the results sorted by key.
//!
//! ## Merge compaction
//!
//! [`merge_bucket`] updates an already compacted bucket.  Every existing
//! `(key, value)` record is expanded back into inputs with the caller's
//! decompressor, the staged new inputs are appended behind them, and the
//! result is compacted exactly like a fresh bucket.
//!
//! ## Guarantees
//!
//! - The rewrite runs under the bucket's exclusive lock and lands through a
//!   temp file and rename, so readers see the old bucket or the new one.
//! - Corrupt records are logged and skipped; they never abort a rewrite.
//! - The bucket's sparse index is dropped while the bucket lock is still
//!   held.  A lookup never pairs the new bucket with the old offsets.
//! - Buckets are independent; [`compress_buckets`] runs them on a pool of
//!   scoped worker threads.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, FileAccessorCache, MappedFile};
use crate::codec::{self, CodecError, ReadOutcome, RecordCursor};
use crate::encoding::{Decode, Encode};
use crate::index::{self, IndexCache, IndexError};
use crate::utils::{WorkerPanicked, remove_file_if_exists, run_parallel};

/// Folds every input collected for one key into the compacted value.
pub type MergeFunction<I, V> = Arc<dyn Fn(Vec<I>) -> V + Send + Sync>;

/// Expands a compacted value back into inputs.  Must be the inverse of the
/// merge function: `decompress(merge(x))` contains every element of `x`.
pub type Decompressor<V, I> = Arc<dyn Fn(&V) -> Vec<I> + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WorkerPanicked> for CompactionError {
    fn from(_: WorkerPanicked) -> Self {
        CompactionError::Internal("compaction worker panicked".into())
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Counters reported by a compaction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Buckets rewritten.
    pub buckets: usize,
    /// Records read, existing compacted records included.
    pub records_read: u64,
    /// Existing compacted records read back by a merge.
    pub existing_records: u64,
    /// Compacted records written.
    pub records_written: u64,
    /// Records skipped because they did not decode.
    pub corrupt_records: u64,
}

impl AddAssign for CompactionStats {
    fn add_assign(&mut self, other: Self) {
        self.buckets += other.buckets;
        self.records_read += other.records_read;
        self.existing_records += other.existing_records;
        self.records_written += other.records_written;
        self.corrupt_records += other.corrupt_records;
    }
}

// ------------------------------------------------------------------------------------------------
// Grouping
// ------------------------------------------------------------------------------------------------

/// Inputs of one bucket grouped by key, keys ordered.
struct Grouped<K, I> {
    groups: BTreeMap<K, Vec<I>>,
    stats: CompactionStats,
}

impl<K: Ord + Decode, I: Decode> Grouped<K, I> {
    fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            stats: CompactionStats::default(),
        }
    }

    /// Add every `(key, input)` record of `data`.
    fn add_inputs(&mut self, source: &Path, data: &[u8]) {
        let mut cursor = RecordCursor::new(data);
        loop {
            match cursor.next_record::<K, I>() {
                ReadOutcome::Record((key, input)) => {
                    self.stats.records_read += 1;
                    self.groups.entry(key).or_default().push(input);
                }
                ReadOutcome::Corrupt { offset, error } => {
                    self.stats.corrupt_records += 1;
                    warn!(
                        path = %source.display(),
                        offset,
                        %error,
                        "skipping corrupt input record"
                    );
                }
                ReadOutcome::EndOfStream => break,
            }
        }
    }

    /// Add every `(key, value)` record of `data`, expanded into inputs.
    fn add_decompressed<V: Decode>(
        &mut self,
        source: &Path,
        data: &[u8],
        decompress: &Decompressor<V, I>,
    ) {
        let mut cursor = RecordCursor::new(data);
        loop {
            match cursor.next_record::<K, V>() {
                ReadOutcome::Record((key, value)) => {
                    self.stats.records_read += 1;
                    self.stats.existing_records += 1;
                    self.groups.entry(key).or_default().extend(decompress(&value));
                }
                ReadOutcome::Corrupt { offset, error } => {
                    self.stats.corrupt_records += 1;
                    warn!(
                        path = %source.display(),
                        offset,
                        %error,
                        "skipping corrupt compacted record"
                    );
                }
                ReadOutcome::EndOfStream => break,
            }
        }
    }

    /// Merge each group and atomically replace `bucket` with the result.
    fn write<V: Encode>(
        self,
        bucket: &Path,
        merge: &MergeFunction<I, V>,
    ) -> Result<CompactionStats, CompactionError>
    where
        K: Encode,
    {
        let Grouped { groups, mut stats } = self;
        stats.records_written = codec::rewrite_atomically::<_, CompactionError, _>(bucket, |w| {
            for (key, inputs) in groups {
                let value = merge(inputs);
                w.write_record(&key, &value)?;
            }
            Ok(w.records())
        })?;
        stats.buckets = 1;
        Ok(stats)
    }
}

// ------------------------------------------------------------------------------------------------
// Bucket operations
// ------------------------------------------------------------------------------------------------

/// Compact one bucket of input records in place.
///
/// A missing bucket is not an error and yields empty statistics.
pub(crate) fn compress_bucket<K, I, V>(
    files: &FileAccessorCache,
    indexes: &IndexCache<K>,
    merge: &MergeFunction<I, V>,
    bucket: &Path,
) -> Result<CompactionStats, CompactionError>
where
    K: Ord + Encode + Decode,
    I: Decode,
    V: Encode,
{
    let stats = {
        let _guard = files.lock_exclusive(bucket)?;
        let Some(source) = MappedFile::open(bucket)? else {
            return Ok(CompactionStats::default());
        };
        let mut grouped = Grouped::<K, I>::new();
        grouped.add_inputs(bucket, source.bytes());
        drop(source);
        let stats = grouped.write(bucket, merge)?;
        index::builder::drop_bucket(files, indexes, bucket)?;
        stats
    };

    debug!(
        path = %bucket.display(),
        read = stats.records_read,
        written = stats.records_written,
        corrupt = stats.corrupt_records,
        "bucket compacted"
    );
    Ok(stats)
}

/// Fold the inputs staged in `staged` into the compacted `bucket`.
///
/// The staged file is removed once the bucket has been replaced.
pub(crate) fn merge_bucket<K, I, V>(
    files: &FileAccessorCache,
    indexes: &IndexCache<K>,
    merge: &MergeFunction<I, V>,
    decompress: &Decompressor<V, I>,
    bucket: &Path,
    staged: &Path,
) -> Result<CompactionStats, CompactionError>
where
    K: Ord + Encode + Decode,
    I: Decode,
    V: Encode + Decode,
{
    let stats = {
        let _guard = files.lock_exclusive(bucket)?;
        let mut grouped = Grouped::<K, I>::new();
        if let Some(existing) = MappedFile::open(bucket)? {
            grouped.add_decompressed(bucket, existing.bytes(), decompress);
        }
        if let Some(new_inputs) = MappedFile::open(staged)? {
            grouped.add_inputs(staged, new_inputs.bytes());
        }
        let stats = grouped.write(bucket, merge)?;
        remove_file_if_exists(staged)?;
        index::builder::drop_bucket(files, indexes, bucket)?;
        stats
    };

    debug!(
        path = %bucket.display(),
        read = stats.records_read,
        written = stats.records_written,
        "bucket merged"
    );
    Ok(stats)
}

/// Run `op` over every bucket on up to `parallelism` threads and sum the
/// statistics.
pub(crate) fn compress_buckets<F>(
    partition: &Path,
    buckets: Vec<PathBuf>,
    parallelism: usize,
    op: F,
) -> Result<CompactionStats, CompactionError>
where
    F: Fn(PathBuf) -> Result<CompactionStats, CompactionError> + Sync,
{
    let per_bucket = run_parallel(buckets, parallelism, op)?;
    let mut total = CompactionStats::default();
    for stats in per_bucket {
        total += stats;
    }
    info!(
        path = %partition.display(),
        buckets = total.buckets,
        records_read = total.records_read,
        records_written = total.records_written,
        corrupt = total.corrupt_records,
        "compaction: complete"
    );
    Ok(total)
}
