//! Keyed shared/exclusive locks, one per absolute path.
//!
//! A path has no lock state until someone asks for it; the entry is
//! removed again once the last holder and the last waiter are gone.
//! Waiting writers block new readers, so a rewrite is never starved by a
//! steady stream of lookups.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::CacheError;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

impl LockState {
    fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.waiting_writers == 0
    }
}

/// Table of per-path locks.
#[derive(Debug, Default)]
pub struct PathLocks {
    table: Mutex<HashMap<PathBuf, LockState>>,
    released: Condvar,
}

/// Access mode held by a [`PathGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, LockState>>, CacheError> {
        self.table
            .lock()
            .map_err(|_| CacheError::Internal("path lock table poisoned".into()))
    }

    /// Block until `path` can be read, then hold it shared.
    pub fn shared(self: &Arc<Self>, path: &Path) -> Result<PathGuard, CacheError> {
        let mut table = self.table()?;
        loop {
            let state = table.entry(path.to_path_buf()).or_default();
            if !state.writer && state.waiting_writers == 0 {
                state.readers += 1;
                break;
            }
            table = self
                .released
                .wait(table)
                .map_err(|_| CacheError::Internal("path lock table poisoned".into()))?;
        }
        Ok(PathGuard {
            locks: Arc::clone(self),
            path: path.to_path_buf(),
            mode: LockMode::Shared,
        })
    }

    /// Block until no one else holds `path`, then hold it exclusively.
    pub fn exclusive(self: &Arc<Self>, path: &Path) -> Result<PathGuard, CacheError> {
        let mut table = self.table()?;
        table.entry(path.to_path_buf()).or_default().waiting_writers += 1;
        loop {
            let state = table.entry(path.to_path_buf()).or_default();
            if !state.writer && state.readers == 0 {
                state.waiting_writers -= 1;
                state.writer = true;
                break;
            }
            tracing::trace!(path = %path.display(), "waiting for exclusive access");
            table = self
                .released
                .wait(table)
                .map_err(|_| CacheError::Internal("path lock table poisoned".into()))?;
        }
        Ok(PathGuard {
            locks: Arc::clone(self),
            path: path.to_path_buf(),
            mode: LockMode::Exclusive,
        })
    }

    /// Number of paths with live lock state.  Test hook.
    pub fn tracked_paths(&self) -> usize {
        self.table().map(|t| t.len()).unwrap_or(0)
    }

    fn release(&self, path: &Path, mode: LockMode) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = table.get_mut(path) {
            match mode {
                LockMode::Shared => state.readers = state.readers.saturating_sub(1),
                LockMode::Exclusive => state.writer = false,
            }
            if state.is_idle() {
                table.remove(path);
            }
        }
        drop(table);
        self.released.notify_all();
    }
}

/// Holds a path lock until dropped.
pub struct PathGuard {
    locks: Arc<PathLocks>,
    path: PathBuf,
    mode: LockMode,
}

impl PathGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathGuard")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.locks.release(&self.path, self.mode);
    }
}
