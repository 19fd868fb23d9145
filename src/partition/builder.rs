//! Write handle for bulk-loading one partition.
//!
//! A [`PartitionBuilder`] appends raw `(key, input)` records to the bucket
//! files of its partition and later compacts them:
//!
//! 1. [`store`](PartitionBuilder::store) from any number of threads.
//! 2. [`complete_adding`](PartitionBuilder::complete_adding) to flush and
//!    close the writers (done implicitly by `compress`).
//! 3. [`compress`](PartitionBuilder::compress) to turn every bucket into a
//!    compacted one.
//! 4. [`rebuild_index`](PartitionBuilder::rebuild_index) to sample the
//!    compacted buckets.
//!
//! A builder only loads an empty partition.  Creating one over a partition
//! that already has bucket files fails with
//! [`PartitionError::InvalidState`]: compacted values would be read back as
//! inputs.  Use a [merge builder](super::merge::PartitionMergeBuilder) to add
//! to existing data, or remove the partition first.
//!
//! Until a bucket is compacted its contents are input records, not values,
//! so reading it through an accessor is only meaningful when `I` and `V`
//! share an encoding.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, trace};

use super::writers::BucketWriters;
use super::{PartitionContext, PartitionError, list_buckets};
use crate::compaction::{self, CompactionStats};
use crate::index;
use crate::{StoreKey, StoreMeta, StoreValue};

/// Append-then-compact writer for one partition.
///
/// `PartitionBuilder` is `Send + Sync`; share it by reference (or `Arc`)
/// between loader threads.
pub struct PartitionBuilder<K, I, V, M> {
    ctx: Arc<PartitionContext<K, I, V, M>>,
    meta: M,
    dir: PathBuf,
    writers: BucketWriters,
    /// `true` while `store` is accepted.  `store` holds the read side for
    /// the duration of an append, `complete_adding` takes the write side.
    open: RwLock<bool>,
    stored: AtomicU64,
}

impl<K, I, V, M> PartitionBuilder<K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    pub(crate) fn new(
        ctx: Arc<PartitionContext<K, I, V, M>>,
        meta: M,
    ) -> Result<Self, PartitionError> {
        let dir = ctx.scheme.catalog_path(&meta)?;
        let existing = list_buckets(&dir)?.len();
        if existing > 0 {
            return Err(PartitionError::InvalidState(format!(
                "partition {} already holds {existing} bucket files; \
                 use a merge builder to add to it or remove it first",
                dir.display()
            )));
        }
        debug!(path = %dir.display(), "partition builder created");
        Ok(Self {
            ctx,
            meta,
            dir,
            writers: BucketWriters::new(),
            open: RwLock::new(true),
            stored: AtomicU64::new(0),
        })
    }

    /// Metadata identifying this partition.
    pub fn meta(&self) -> &M {
        &self.meta
    }

    /// Directory of this partition.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Append one input record to the bucket `key` maps to.
    ///
    /// The first append to a bucket drops its cached handle and its sparse
    /// index, both of which stop describing the file from then on.
    ///
    /// # Errors
    ///
    /// [`PartitionError::InvalidState`] after [`complete_adding`](Self::complete_adding).
    pub fn store(&self, key: &K, input: &I) -> Result<(), PartitionError> {
        let open = self
            .open
            .read()
            .map_err(|_| PartitionError::Internal("builder state poisoned".into()))?;
        if !*open {
            return Err(PartitionError::InvalidState(
                "store called after complete_adding".into(),
            ));
        }

        let bucket = self.ctx.bucket_path(&self.dir, key, &self.meta)?;
        let offset = self.writers.append(&bucket, key, input, |path| {
            self.ctx.files.invalidate(path)?;
            index::builder::drop_bucket(&self.ctx.files, &self.ctx.indexes, path)?;
            Ok(())
        })?;
        self.stored.fetch_add(1, Ordering::Relaxed);
        trace!(path = %bucket.display(), offset, "input record stored");
        Ok(())
    }

    /// Flush, fsync, and close every bucket writer.
    ///
    /// Idempotent.  Any later [`store`](Self::store) fails.
    pub fn complete_adding(&self) -> Result<(), PartitionError> {
        let mut open = self
            .open
            .write()
            .map_err(|_| PartitionError::Internal("builder state poisoned".into()))?;
        if !*open {
            return Ok(());
        }
        *open = false;

        let written = self.writers.finish()?;
        for bucket in &written {
            // Readers must remap to see the appended bytes.
            self.ctx.files.invalidate(bucket)?;
        }
        info!(
            path = %self.dir.display(),
            buckets = written.len(),
            records = self.total_records(),
            "adding completed"
        );
        Ok(())
    }

    /// Compact every bucket of the partition.
    ///
    /// Completes adding first if that has not happened yet.  Each bucket's
    /// sparse index is dropped; call [`rebuild_index`](Self::rebuild_index)
    /// afterwards to regenerate them.
    pub fn compress(&self) -> Result<CompactionStats, PartitionError> {
        self.complete_adding()?;
        let ctx = &self.ctx;
        let buckets = list_buckets(&self.dir)?;
        let stats = compaction::compress_buckets(&self.dir, buckets, ctx.parallelism, |bucket| {
            compaction::compress_bucket::<K, I, V>(&ctx.files, &ctx.indexes, &ctx.merge, &bucket)
        })?;
        Ok(stats)
    }

    /// Regenerate the sparse index of every bucket.
    ///
    /// Returns the number of samples written.
    ///
    /// # Errors
    ///
    /// [`IndexError::NotCompacted`](crate::index::IndexError::NotCompacted)
    /// (wrapped) if a bucket has not been compacted.
    pub fn rebuild_index(&self) -> Result<usize, PartitionError> {
        self.ctx.rebuild_indexes(&self.dir)
    }

    /// Number of input records stored through this builder.
    pub fn total_records(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

impl<K, I, V, M> Drop for PartitionBuilder<K, I, V, M> {
    fn drop(&mut self) {
        self.writers.flush_quietly();
    }
}
