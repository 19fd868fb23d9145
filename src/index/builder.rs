//! Sparse index construction and removal.
//!
//! - **Step(n)** keeps every n-th record, starting with the first.  The
//!   sample offset is the record start, taken before its key is decoded.
//! - **AbsoluteCount(m)** collects every `(key, offset)` of the bucket,
//!   then keeps `m` evenly spaced ones, always including the first.
//!
//! Both strategies require compacted input.  The scan checks that every key
//! is strictly greater than the one before it and fails with
//! [`IndexError::NotCompacted`] otherwise, leaving any previous index file
//! untouched.
//!
//! The index file is written to a temp file and renamed into place while
//! the index path is held exclusively, so a concurrent lookup sees either
//! the old index, the new one, or none.

use std::path::Path;

use tracing::{debug, info, warn};

use super::{IndexCache, IndexEntry, IndexError, IndexStrategy, index_path};
use crate::cache::FileAccessorCache;
use crate::codec::{self, ReadOutcome, RecordCursor};
use crate::encoding::{Decode, Encode};
use crate::utils::remove_file_if_exists;

/// Buckets with fewer records than this get no index.
const MIN_INDEXED_RECORDS: usize = 2;

/// Pick samples from a compacted bucket image.
///
/// Returns the samples and the number of readable records in the bucket.
pub(crate) fn sample<K: Decode + Ord + Clone>(
    bucket: &Path,
    data: &[u8],
    strategy: IndexStrategy,
) -> Result<(Vec<IndexEntry<K>>, usize), IndexError> {
    let mut cursor = RecordCursor::new(data);
    let mut collected = Vec::new();
    let mut previous: Option<K> = None;
    let mut records = 0usize;

    loop {
        let (key, offset) = match cursor.next_key::<K>() {
            ReadOutcome::Record(entry) => entry,
            ReadOutcome::Corrupt { offset, error } => {
                warn!(
                    path = %bucket.display(),
                    offset,
                    %error,
                    "skipping corrupt record while indexing"
                );
                continue;
            }
            ReadOutcome::EndOfStream => break,
        };
        if previous.as_ref().is_some_and(|p| key <= *p) {
            return Err(IndexError::NotCompacted {
                path: bucket.to_path_buf(),
                offset,
            });
        }

        let keep = match strategy {
            IndexStrategy::Step(step) => records % step.max(1) == 0,
            IndexStrategy::AbsoluteCount(_) => true,
        };
        if keep {
            collected.push(IndexEntry {
                key: key.clone(),
                offset,
            });
        }
        previous = Some(key);
        records += 1;
    }

    let samples = match strategy {
        IndexStrategy::Step(_) => collected,
        IndexStrategy::AbsoluteCount(count) => spread(collected, count.max(1)),
    };
    Ok((samples, records))
}

/// Keep `count` evenly spaced entries of `all`, starting with the first.
fn spread<K>(all: Vec<IndexEntry<K>>, count: usize) -> Vec<IndexEntry<K>> {
    let total = all.len();
    if total <= count {
        return all;
    }
    let mut slots: Vec<Option<IndexEntry<K>>> = all.into_iter().map(Some).collect();
    (0..count)
        .filter_map(|i| slots[i * total / count].take())
        .collect()
}

/// Rebuild the index of one bucket.
///
/// Returns the number of samples written (0 when the bucket is missing or
/// too small, in which case any stale index is removed).
pub(crate) fn rebuild_bucket<K: Decode + Encode + Ord + Clone>(
    files: &FileAccessorCache,
    cache: &IndexCache<K>,
    strategy: IndexStrategy,
    bucket: &Path,
) -> Result<usize, IndexError> {
    let Some(lease) = files.acquire(bucket)? else {
        drop_bucket(files, cache, bucket)?;
        return Ok(0);
    };

    let (samples, records) = sample::<K>(bucket, lease.bytes(), strategy)?;
    if records < MIN_INDEXED_RECORDS {
        debug!(path = %bucket.display(), records, "bucket too small to index");
        drop_bucket(files, cache, bucket)?;
        return Ok(0);
    }

    let path = index_path(bucket);
    let _guard = files.lock_exclusive(&path)?;
    codec::rewrite_atomically::<_, IndexError, _>(&path, |w| {
        for entry in &samples {
            w.write_index_entry(&entry.key, entry.offset)?;
        }
        Ok(())
    })?;
    cache.invalidate(bucket)?;

    info!(
        path = %bucket.display(),
        records,
        samples = samples.len(),
        ?strategy,
        "sparse index rebuilt"
    );
    Ok(samples.len())
}

/// Delete the index of one bucket and forget its cached samples.
///
/// Returns whether an index file existed.
pub(crate) fn drop_bucket<K>(
    files: &FileAccessorCache,
    cache: &IndexCache<K>,
    bucket: &Path,
) -> Result<bool, IndexError> {
    let path = index_path(bucket);
    let removed = {
        let _guard = files.lock_exclusive(&path)?;
        remove_file_if_exists(&path)?
    };
    cache.invalidate(bucket)?;
    if removed {
        debug!(path = %bucket.display(), "sparse index dropped");
    }
    Ok(removed)
}
