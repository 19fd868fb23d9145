//! Store facade.
//!
//! ## Design Overview
//!
//! A [`Store`] binds a root folder, the partition functions, the merge
//! function, and the shared caches into one handle.  It hands out the
//! per-partition handles:
//!
//! - [`create_builder`](Store::create_builder): bulk-load and compact.
//! - [`create_merge_accessor`](Store::create_merge_accessor): fold new
//!   inputs into compacted data.
//! - [`create_accessor`](Store::create_accessor): lookups, scans, removal.
//!
//! and answers cross-partition reads ([`search`](Store::search),
//! [`bypass`](Store::bypass), [`exists`](Store::exists)) directly.
//!
//! Every handle shares the store's [`FileAccessorCache`] and sparse index
//! cache, so locking and invalidation are consistent across handles.
//!
//! # Background sweeper
//!
//! When [`StoreOptions::eviction_interval`] is set, a named background
//! thread wakes on a `crossbeam` ticker and closes file handles idle for
//! longer than [`StoreOptions::file_cache_expiration`].  The thread is
//! stopped and joined by [`Store::close`] or on drop.

mod search;

#[cfg(test)]
pub(crate) mod tests;

pub use search::{SearchIter, SearchRequest, SearchResults};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::cache::{CacheError, Clock, DEFAULT_EXPIRATION, FileAccessorCache, SystemClock};
use crate::compaction::{Decompressor, MergeFunction};
use crate::index::{IndexCache, IndexError, IndexOptions};
use crate::partition::accessor::{PartitionAccessor, Scan};
use crate::partition::builder::PartitionBuilder;
use crate::partition::merge::PartitionMergeBuilder;
use crate::partition::{
    CatalogPartition, FilePartition, PartitionContext, PartitionError, PartitionScheme,
    list_buckets,
};
use crate::{StoreKey, StoreMeta, StoreValue};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`].
///
/// `root_folder`, `file_partition`, and `merge_function` have no usable
/// default and must be set.  Everything else defaults via
/// [`StoreOptions::default()`].  The options are validated by
/// [`Store::open`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use partitiondb::{FilePartition, IndexOptions, IndexStrategy, StoreOptions};
///
/// let options = StoreOptions::<u64, u64, u64, ()> {
///     root_folder: "/tmp/counters".into(),
///     file_partition: Some(FilePartition::new("mod16", |key: &u64, _: &()| {
///         format!("{:02}", key % 16)
///     })),
///     merge_function: Some(Arc::new(|inputs: Vec<u64>| inputs.len() as u64)),
///     index: IndexOptions {
///         strategy: IndexStrategy::Step(128),
///         ..IndexOptions::default()
///     },
///     eviction_interval: Some(Duration::from_secs(10)),
///     ..StoreOptions::default()
/// };
/// ```
pub struct StoreOptions<K, I, V, M> {
    /// Directory holding every partition.  Created if missing.
    ///
    /// Must not be empty.
    pub root_folder: PathBuf,

    /// Ordered functions turning metadata into directory segments.
    ///
    /// Default: none, every partition lives directly in `root_folder`.
    pub catalog_partitions: Vec<CatalogPartition<M>>,

    /// Function selecting the bucket file of a key.
    ///
    /// Required.
    pub file_partition: Option<FilePartition<K, M>>,

    /// Function folding every input of a key into its compacted value.
    ///
    /// Required.
    pub merge_function: Option<MergeFunction<I, V>>,

    /// Sparse index settings.
    ///
    /// Default: enabled, `AbsoluteCount(64)`, samples cached in memory.
    pub index: IndexOptions,

    /// Maximum number of worker threads used by one compaction, reindex,
    /// or batch operation.
    ///
    /// Default: 4. Must be ≥ 1.
    pub max_degree_of_parallelism: usize,

    /// Idle period after which a cached file handle is closed.
    ///
    /// Default: 30 minutes. Must be > 0.
    pub file_cache_expiration: Duration,

    /// How often the background sweeper evicts idle handles.  `None`
    /// disables the sweeper; eviction then only happens through
    /// [`Store::evict_idle_handles`].
    ///
    /// Default: 60 seconds. Must be > 0 when set.
    pub eviction_interval: Option<Duration>,

    /// Time source of the file cache.
    ///
    /// Default: `None`, the system clock.  Tests inject a
    /// [`ManualClock`](crate::cache::ManualClock).
    pub clock: Option<Arc<dyn Clock>>,
}

impl<K, I, V, M> Default for StoreOptions<K, I, V, M> {
    fn default() -> Self {
        Self {
            root_folder: PathBuf::new(),
            catalog_partitions: Vec::new(),
            file_partition: None,
            merge_function: None,
            index: IndexOptions::default(),
            max_degree_of_parallelism: 4,
            file_cache_expiration: DEFAULT_EXPIRATION,
            eviction_interval: Some(Duration::from_secs(60)),
            clock: None,
        }
    }
}

impl<K, I, V, M> StoreOptions<K, I, V, M> {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), StoreError> {
        if self.root_folder.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("root_folder must be set".into()));
        }
        if self.file_partition.is_none() {
            return Err(StoreError::InvalidConfig("file_partition must be set".into()));
        }
        if self.merge_function.is_none() {
            return Err(StoreError::InvalidConfig("merge_function must be set".into()));
        }
        if let Some(level) = self.catalog_partitions.iter().find(|p| p.name().trim().is_empty()) {
            return Err(StoreError::InvalidConfig(format!(
                "catalog partition {level:?} has an empty name"
            )));
        }
        self.index.validate().map_err(StoreError::InvalidConfig)?;
        if self.max_degree_of_parallelism < 1 {
            return Err(StoreError::InvalidConfig(
                "max_degree_of_parallelism must be >= 1".into(),
            ));
        }
        if self.file_cache_expiration.is_zero() {
            return Err(StoreError::InvalidConfig(
                "file_cache_expiration must be > 0".into(),
            ));
        }
        if self.eviction_interval.is_some_and(|i| i.is_zero()) {
            return Err(StoreError::InvalidConfig(
                "eviction_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl<K, I, V, M> fmt::Debug for StoreOptions<K, I, V, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("root_folder", &self.root_folder)
            .field("catalog_partitions", &self.catalog_partitions)
            .field("file_partition", &self.file_partition)
            .field("index", &self.index)
            .field("max_degree_of_parallelism", &self.max_degree_of_parallelism)
            .field("file_cache_expiration", &self.file_cache_expiration)
            .field("eviction_interval", &self.eviction_interval)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Partition(#[from] PartitionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Background sweeper
// ------------------------------------------------------------------------------------------------

/// Handle of the idle-handle sweeper thread.
///
/// Dropping `shutdown` disconnects the channel the thread selects on,
/// which ends its loop.
struct Sweeper {
    shutdown: crossbeam::channel::Sender<()>,
    worker: thread::JoinHandle<()>,
}

impl Sweeper {
    fn spawn(files: Arc<FileAccessorCache>, interval: Duration) -> io::Result<Self> {
        let (shutdown, stop) = crossbeam::channel::bounded::<()>(0);
        let ticker = crossbeam::channel::tick(interval);
        let worker = thread::Builder::new()
            .name("partitiondb-sweeper".into())
            .spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => match files.evict_expired() {
                            Ok(0) => {}
                            Ok(evicted) => debug!(evicted, "sweeper: idle handles closed"),
                            Err(e) => error!("sweeper: eviction failed: {e}"),
                        },
                        recv(stop) -> _ => break,
                    }
                }
            })?;
        Ok(Self { shutdown, worker })
    }

    fn stop(self) {
        drop(self.shutdown);
        if self.worker.join().is_err() {
            error!("sweeper thread panicked");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// # Thread safety
///
/// `Store` is `Send + Sync`.  Handles created from it may be used from
/// any thread, and outlive the store itself.
///
/// # Shutdown
///
/// [`Store::close`] stops the sweeper and releases every cached handle.
/// Later calls on the store return [`StoreError::Closed`].  Dropping the
/// store without closing it stops the sweeper as well.
pub struct Store<K, I, V, M> {
    ctx: Arc<PartitionContext<K, I, V, M>>,
    sweeper: Mutex<Option<Sweeper>>,
    closed: AtomicBool,
}

impl<K, I, V, M> fmt::Debug for Store<K, I, V, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.ctx.scheme.root())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, I, V, M> Store<K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    /// Opens (or creates) a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if the options are incomplete
    /// or out of range.
    pub fn open(options: StoreOptions<K, I, V, M>) -> Result<Self, StoreError> {
        options.validate()?;
        let StoreOptions {
            root_folder,
            catalog_partitions,
            file_partition,
            merge_function,
            index,
            max_degree_of_parallelism,
            file_cache_expiration,
            eviction_interval,
            clock,
        } = options;
        let (Some(file_partition), Some(merge)) = (file_partition, merge_function) else {
            return Err(StoreError::InvalidConfig(
                "file_partition and merge_function must be set".into(),
            ));
        };

        std::fs::create_dir_all(&root_folder)?;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let files = Arc::new(FileAccessorCache::with_clock(file_cache_expiration, clock));
        let sweeper = match eviction_interval {
            Some(interval) => Some(Sweeper::spawn(Arc::clone(&files), interval)?),
            None => None,
        };

        info!(
            path = %root_folder.display(),
            catalog_levels = catalog_partitions.len(),
            index = index.enabled,
            parallelism = max_degree_of_parallelism,
            "store opened"
        );

        let ctx = PartitionContext {
            scheme: PartitionScheme::new(root_folder, catalog_partitions, file_partition),
            merge,
            index,
            parallelism: max_degree_of_parallelism,
            files,
            indexes: IndexCache::new(),
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
        })
    }

    /// Stops the sweeper and releases every cached handle and sample
    /// array.
    ///
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_sweeper()?;
        self.ctx.files.clear()?;
        self.ctx.indexes.clear()?;
        info!(path = %self.ctx.scheme.root().display(), "store closed");
        Ok(())
    }

    /// Root folder of the store.
    pub fn root(&self) -> &Path {
        self.ctx.scheme.root()
    }

    /// The shared file handle cache.
    pub fn file_cache(&self) -> &FileAccessorCache {
        &self.ctx.files
    }

    // --------------------------------------------------------------------------------------------
    // Partition handles
    // --------------------------------------------------------------------------------------------

    /// Writer bulk-loading the partition identified by `meta`.
    ///
    /// The partition must not hold any bucket files yet; otherwise this
    /// fails with [`PartitionError::InvalidState`] wrapped in
    /// [`StoreError::Partition`].
    pub fn create_builder(&self, meta: M) -> Result<PartitionBuilder<K, I, V, M>, StoreError> {
        self.check_open()?;
        Ok(PartitionBuilder::new(Arc::clone(&self.ctx), meta)?)
    }

    /// Writer folding new inputs into the compacted partition identified
    /// by `meta`.
    ///
    /// `decompress` must expand a compacted value back into inputs the
    /// merge function accepts.
    pub fn create_merge_accessor(
        &self,
        meta: M,
        decompress: Decompressor<V, I>,
    ) -> Result<PartitionMergeBuilder<K, I, V, M>, StoreError> {
        self.check_open()?;
        Ok(PartitionMergeBuilder::new(Arc::clone(&self.ctx), meta, decompress)?)
    }

    /// Reader of the partition identified by `meta`.
    pub fn create_accessor(&self, meta: M) -> Result<PartitionAccessor<K, I, V, M>, StoreError> {
        self.check_open()?;
        Ok(PartitionAccessor::new(Arc::clone(&self.ctx), meta)?)
    }

    // --------------------------------------------------------------------------------------------
    // Cross-partition reads
    // --------------------------------------------------------------------------------------------

    /// Lazy lookup of many keys across many partitions.
    ///
    /// Nothing is read until the results are iterated, and every call to
    /// [`SearchResults::iter`] runs the search again.
    pub fn search(
        &self,
        request: SearchRequest<K, M>,
    ) -> Result<SearchResults<K, I, V, M>, StoreError> {
        self.check_open()?;
        Ok(SearchResults::new(Arc::clone(&self.ctx), request))
    }

    /// Lazy scan of every record of the partition identified by `meta`.
    pub fn bypass(&self, meta: &M) -> Result<Scan<(K, V)>, StoreError> {
        self.check_open()?;
        let dir = self.ctx.scheme.catalog_path(meta)?;
        Ok(Scan::records(Arc::clone(&self.ctx.files), list_buckets(&dir)?))
    }

    /// Lazy scan of every key of the partition identified by `meta`.
    pub fn bypass_keys(&self, meta: &M) -> Result<Scan<K>, StoreError> {
        self.check_open()?;
        let dir = self.ctx.scheme.catalog_path(meta)?;
        Ok(Scan::keys(Arc::clone(&self.ctx.files), list_buckets(&dir)?))
    }

    /// Whether `key` is present in the partition identified by `meta`.
    pub fn exists(&self, meta: &M, key: &K) -> Result<bool, StoreError> {
        self.check_open()?;
        let accessor = PartitionAccessor::new(Arc::clone(&self.ctx), meta.clone())?;
        Ok(accessor.contains_key(key)?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Delete the partition identified by `meta`.
    ///
    /// Returns whether it existed.
    pub fn remove_partition(&self, meta: &M) -> Result<bool, StoreError> {
        self.check_open()?;
        let dir = self.ctx.scheme.catalog_path(meta)?;
        Ok(self.ctx.remove_tree(&dir)?)
    }

    /// Forget every cached file handle and sample array.
    ///
    /// Handles in use stay alive until their users release them.
    pub fn drop_cache(&self) -> Result<(), StoreError> {
        self.check_open()?;
        let handles = self.ctx.files.handle_count();
        self.ctx.files.clear()?;
        let samples = self.ctx.indexes.len();
        self.ctx.indexes.clear()?;
        debug!(handles, samples, "caches dropped");
        Ok(())
    }

    /// Close every file handle idle for longer than the expiration period.
    ///
    /// This is what the sweeper runs.  Returns the number of handles closed.
    pub fn evict_idle_handles(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.ctx.files.evict_expired()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn stop_sweeper(&self) -> Result<(), StoreError> {
        let sweeper = self
            .sweeper
            .lock()
            .map_err(|_| StoreError::Internal("sweeper slot poisoned".into()))?
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        Ok(())
    }
}

impl<K, I, V, M> Drop for Store<K, I, V, M> {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
    }
}
