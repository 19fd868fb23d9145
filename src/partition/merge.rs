//! Write handle for folding new inputs into an already compacted partition.
//!
//! Inputs are staged next to the data, one staging file per bucket:
//!
//! ```text
//! <partition>/__merge__/<bucket>
//! ```
//!
//! [`PartitionMergeBuilder::compress`] then rewrites each touched bucket
//! from its decompressed existing values plus the staged inputs, removes
//! the staging folder, and reindexes the touched buckets.  Untouched
//! buckets are not read.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, trace};

use super::writers::BucketWriters;
use super::{MERGE_DIR, PartitionContext, PartitionError, list_buckets};
use crate::compaction::{self, CompactionStats, Decompressor};
use crate::index;
use crate::utils::{remove_dir_if_exists, run_parallel};
use crate::{StoreKey, StoreMeta, StoreValue};

/// Incremental writer for one compacted partition.
pub struct PartitionMergeBuilder<K, I, V, M> {
    ctx: Arc<PartitionContext<K, I, V, M>>,
    meta: M,
    dir: PathBuf,
    decompress: Decompressor<V, I>,
    writers: BucketWriters,
    /// Held shared by `store`, exclusively by `compress`.
    staging: RwLock<()>,
    staged: AtomicU64,
    existing_read: AtomicU64,
}

impl<K, I, V, M> PartitionMergeBuilder<K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    pub(crate) fn new(
        ctx: Arc<PartitionContext<K, I, V, M>>,
        meta: M,
        decompress: Decompressor<V, I>,
    ) -> Result<Self, PartitionError> {
        let dir = ctx.scheme.catalog_path(&meta)?;
        debug!(path = %dir.display(), "partition merge builder created");
        Ok(Self {
            ctx,
            meta,
            dir,
            decompress,
            writers: BucketWriters::new(),
            staging: RwLock::new(()),
            staged: AtomicU64::new(0),
            existing_read: AtomicU64::new(0),
        })
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Stage one input for the bucket `key` maps to.
    ///
    /// Staged inputs are invisible to readers until [`compress`](Self::compress).
    pub fn store(&self, key: &K, input: &I) -> Result<(), PartitionError> {
        let _staging = self
            .staging
            .read()
            .map_err(|_| PartitionError::Internal("merge staging lock poisoned".into()))?;
        let staged = self
            .dir
            .join(MERGE_DIR)
            .join(self.ctx.scheme.bucket_name(key, &self.meta)?);
        let offset = self.writers.append(&staged, key, input, |_| Ok(()))?;
        self.staged.fetch_add(1, Ordering::Relaxed);
        trace!(path = %staged.display(), offset, "input staged");
        Ok(())
    }

    /// Fold every staged input into its bucket.
    ///
    /// Blocks concurrent [`store`](Self::store) calls while it runs.  The
    /// builder stays usable afterwards; new inputs start a fresh staging
    /// round.
    pub fn compress(&self) -> Result<CompactionStats, PartitionError> {
        let _staging = self
            .staging
            .write()
            .map_err(|_| PartitionError::Internal("merge staging lock poisoned".into()))?;
        self.writers.finish()?;

        let staging_dir = self.dir.join(MERGE_DIR);
        let staged = list_buckets(&staging_dir)?;
        let touched: Vec<PathBuf> = staged
            .iter()
            .filter_map(|s| s.file_name().map(|name| self.dir.join(name)))
            .collect();

        let ctx = &self.ctx;
        let decompress = &self.decompress;
        let stats = compaction::compress_buckets(&self.dir, staged, ctx.parallelism, |staged| {
            let Some(name) = staged.file_name() else {
                return Ok(CompactionStats::default());
            };
            let bucket = self.dir.join(name);
            compaction::merge_bucket::<K, I, V>(
                &ctx.files,
                &ctx.indexes,
                &ctx.merge,
                decompress,
                &bucket,
                &staged,
            )
        })?;
        remove_dir_if_exists(&staging_dir)?;

        self.existing_read.fetch_add(stats.existing_records, Ordering::Relaxed);

        if ctx.index.enabled {
            let strategy = ctx.index.strategy;
            let samples: Vec<usize> = run_parallel(touched, ctx.parallelism, |bucket| {
                index::builder::rebuild_bucket(&ctx.files, &ctx.indexes, strategy, &bucket)
                    .map_err(PartitionError::from)
            })?;
            debug!(
                path = %self.dir.display(),
                samples = samples.iter().sum::<usize>(),
                "touched buckets reindexed"
            );
        }

        info!(
            path = %self.dir.display(),
            buckets = stats.buckets,
            records_written = stats.records_written,
            "merge: complete"
        );
        Ok(stats)
    }

    /// Inputs staged through this builder plus the existing compacted
    /// records read back while compressing.
    ///
    /// Inputs left in the staging folder by an earlier builder are merged
    /// but not counted.
    pub fn total_records(&self) -> u64 {
        self.staged.load(Ordering::Relaxed) + self.existing_read.load(Ordering::Relaxed)
    }
}

impl<K, I, V, M> Drop for PartitionMergeBuilder<K, I, V, M> {
    fn drop(&mut self) {
        self.writers.flush_quietly();
    }
}
