//! Append writers shared by the partition builder and the merge builder.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use super::PartitionError;
use crate::codec::{self, RecordWriter};
use crate::encoding::Encode;

type BucketWriter = RecordWriter<BufWriter<File>>;
type WriterTable = HashMap<PathBuf, Arc<Mutex<BucketWriter>>>;

/// One open append writer per bucket file.
///
/// The table lock is only held to look a writer up or open it.  Each writer
/// has its own mutex, so appends to different buckets run concurrently and
/// appends to one bucket are serialized.
#[derive(Default)]
pub(crate) struct BucketWriters {
    writers: Mutex<WriterTable>,
}

impl BucketWriters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, WriterTable>, PartitionError> {
        self.writers
            .lock()
            .map_err(|_| PartitionError::Internal("writer table poisoned".into()))
    }

    /// Append `(key, value)` to `path`.
    ///
    /// The first append to a path since the last [`finish`](Self::finish)
    /// runs `on_open` before the file is opened.
    pub(crate) fn append<K, T, F>(
        &self,
        path: &Path,
        key: &K,
        value: &T,
        on_open: F,
    ) -> Result<u64, PartitionError>
    where
        K: Encode,
        T: Encode,
        F: FnOnce(&Path) -> Result<(), PartitionError>,
    {
        let writer = {
            let mut table = self.table()?;
            match table.get(path) {
                Some(writer) => Arc::clone(writer),
                None => {
                    on_open(path)?;
                    let writer = Arc::new(Mutex::new(codec::open_append(path)?));
                    table.insert(path.to_path_buf(), Arc::clone(&writer));
                    trace!(path = %path.display(), "bucket writer opened");
                    writer
                }
            }
        };
        let mut writer = writer
            .lock()
            .map_err(|_| PartitionError::Internal("bucket writer poisoned".into()))?;
        Ok(writer.write_record(key, value)?)
    }

    /// Flush, fsync, and close every writer.
    ///
    /// Returns the paths that were written.
    pub(crate) fn finish(&self) -> Result<Vec<PathBuf>, PartitionError> {
        let drained: Vec<_> = self.table()?.drain().collect();
        let mut paths = Vec::with_capacity(drained.len());
        for (path, writer) in drained {
            writer
                .lock()
                .map_err(|_| PartitionError::Internal("bucket writer poisoned".into()))?
                .sync()?;
            paths.push(path);
        }
        paths.sort();
        Ok(paths)
    }

    /// Flush every writer, logging instead of failing.
    pub(crate) fn flush_quietly(&self) {
        let Ok(table) = self.writers.lock() else {
            return;
        };
        for (path, writer) in table.iter() {
            if let Ok(mut writer) = writer.lock() {
                if let Err(e) = writer.flush() {
                    warn!(path = %path.display(), %e, "failed to flush bucket writer");
                }
            }
        }
    }
}
