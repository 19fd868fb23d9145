//! Physical file accessor cache.
//!
//! ## Design Overview
//!
//! Every read of a bucket file or index file goes through a
//! [`FileAccessorCache`].  The cache owns one read-only memory map per
//! absolute path and is the single authority on who may touch a path:
//!
//! - **Readers** call [`acquire`](FileAccessorCache::acquire) and get a
//!   [`FileLease`], which holds the path's shared lock and a reference to
//!   the cached map.  A lease can be [detached](FileLease::detach) into the
//!   bare map so a lazy scan can outlive the lock without blocking writers.
//! - **Rewriters** (compaction, index rebuild, key removal) call
//!   [`lock_exclusive`](FileAccessorCache::lock_exclusive).  The call
//!   blocks until every lease on the path is gone, then drops the cached
//!   map so the next reader maps the new file.
//!
//! # Eviction
//!
//! Each cached map records the [`Clock`] reading of its last access.
//! [`evict_expired`](FileAccessorCache::evict_expired) closes every map
//! idle for longer than the configured expiration.  A map referenced by a
//! lease or by a detached scan is never evicted.  The store calls
//! `evict_expired` from a background sweeper thread; tests call it
//! directly with a [`ManualClock`].
//!
//! # Safety of the maps
//!
//! Files are never modified in place.  Rewrites land in a temp file that
//! is renamed over the original, appends only add bytes past the mapped
//! length, and deletions unlink.  A live map therefore never observes a
//! mutation of the bytes it covers.

mod clock;
mod lock;


pub use clock::{Clock, ManualClock, SystemClock};
pub use lock::{LockMode, PathGuard, PathLocks};

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

/// Default idle period after which a cached handle is closed.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(30 * 60);

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced by the file accessor cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Opening or mapping a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An internal lock was poisoned.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Mapped file
// ------------------------------------------------------------------------------------------------

/// A read-only mapping of one file, as cached by [`FileAccessorCache`].
pub struct MappedFile {
    path: PathBuf,
    map: Option<Mmap>,
    last_access: AtomicU64,
}

impl MappedFile {
    /// Map `path`, or `Ok(None)` if it does not exist.
    ///
    /// Empty files are not mapped and read as an empty slice.
    pub fn open(path: &Path) -> io::Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let map = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: see "Safety of the maps" in the module docs.  The file
            // is read-only mapped and never truncated or rewritten in place.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Some(Self {
            path: path.to_path_buf(),
            map,
            last_access: AtomicU64::new(0),
        }))
    }

    /// The mapped bytes.
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn touch(&self, now: Duration) {
        self.last_access.store(as_nanos(now), Ordering::Relaxed);
    }

    fn idle_for(&self, now: Duration) -> Duration {
        Duration::from_nanos(as_nanos(now).saturating_sub(self.last_access.load(Ordering::Relaxed)))
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

// ------------------------------------------------------------------------------------------------
// Lease
// ------------------------------------------------------------------------------------------------

/// Shared access to a cached file.  The path stays read-locked until the
/// lease is dropped or detached.
#[derive(Debug)]
pub struct FileLease {
    file: Arc<MappedFile>,
    _guard: PathGuard,
}

impl FileLease {
    /// Release the path lock but keep the mapping alive.
    ///
    /// The returned map keeps showing the file as it was when the lease was
    /// taken, even if the path is rewritten afterwards.
    pub fn detach(self) -> Arc<MappedFile> {
        self.file
    }
}

impl Deref for FileLease {
    type Target = MappedFile;

    fn deref(&self) -> &MappedFile {
        &self.file
    }
}

// ------------------------------------------------------------------------------------------------
// Cache
// ------------------------------------------------------------------------------------------------

/// Cache of memory-mapped files keyed by absolute path.
///
/// `FileAccessorCache` is `Send + Sync`.
#[derive(Debug)]
pub struct FileAccessorCache {
    clock: Arc<dyn Clock>,
    expiration: Duration,
    handles: Mutex<HashMap<PathBuf, Arc<MappedFile>>>,
    locks: Arc<PathLocks>,
}

impl FileAccessorCache {
    /// Cache on the system clock.
    pub fn new(expiration: Duration) -> Self {
        Self::with_clock(expiration, Arc::new(SystemClock::new()))
    }

    /// Cache on an injected clock.
    pub fn with_clock(expiration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            expiration,
            handles: Mutex::new(HashMap::new()),
            locks: Arc::new(PathLocks::new()),
        }
    }

    fn handles(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, Arc<MappedFile>>>, CacheError> {
        self.handles
            .lock()
            .map_err(|_| CacheError::Internal("handle table poisoned".into()))
    }

    /// Take shared access to `path`, mapping it if it is not cached.
    ///
    /// Blocks while the path is held exclusively.  Returns `Ok(None)` if
    /// the file does not exist.
    pub fn acquire(&self, path: &Path) -> Result<Option<FileLease>, CacheError> {
        let guard = self.locks.shared(path)?;
        let now = self.clock.now();

        if let Some(file) = self.handles()?.get(path) {
            file.touch(now);
            return Ok(Some(FileLease {
                file: Arc::clone(file),
                _guard: guard,
            }));
        }

        let Some(opened) = MappedFile::open(path)? else {
            return Ok(None);
        };
        opened.touch(now);

        let file = {
            let mut handles = self.handles()?;
            Arc::clone(
                handles
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(opened)),
            )
        };
        debug!(path = %path.display(), len = file.len(), "file handle opened");
        Ok(Some(FileLease {
            file,
            _guard: guard,
        }))
    }

    /// Take exclusive access to `path` and drop its cached handle.
    ///
    /// Blocks until every outstanding lease on the path is released.
    pub fn lock_exclusive(&self, path: &Path) -> Result<PathGuard, CacheError> {
        let guard = self.locks.exclusive(path)?;
        self.invalidate(path)?;
        Ok(guard)
    }

    /// Forget the cached handle for `path`, if any.
    pub fn invalidate(&self, path: &Path) -> Result<(), CacheError> {
        if self.handles()?.remove(path).is_some() {
            debug!(path = %path.display(), "file handle invalidated");
        }
        Ok(())
    }

    /// Forget every cached handle under `dir`.
    pub fn invalidate_dir(&self, dir: &Path) -> Result<usize, CacheError> {
        let mut handles = self.handles()?;
        let before = handles.len();
        handles.retain(|path, _| !path.starts_with(dir));
        Ok(before - handles.len())
    }

    /// Forget every cached handle.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.handles()?.clear();
        Ok(())
    }

    /// Close every handle idle for longer than the expiration period.
    ///
    /// Handles still referenced by a lease or a detached scan are skipped.
    /// Returns the number of handles closed.
    pub fn evict_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let expiration = self.expiration;
        let mut handles = self.handles()?;
        let before = handles.len();
        handles.retain(|_, file| Arc::strong_count(file) > 1 || file.idle_for(now) < expiration);
        let evicted = before - handles.len();
        if evicted > 0 {
            debug!(evicted, remaining = handles.len(), "idle file handles evicted");
        }
        Ok(evicted)
    }

    /// Number of cached handles.  Test hook.
    pub fn handle_count(&self) -> usize {
        self.handles().map(|h| h.len()).unwrap_or(0)
    }

    /// Whether `path` currently has a cached handle.  Test hook.
    pub fn is_cached(&self, path: &Path) -> bool {
        self.handles().map(|h| h.contains_key(path)).unwrap_or(false)
    }

    /// Idle period after which handles are evicted.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }
}
