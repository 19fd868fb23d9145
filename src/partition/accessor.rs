//! Read and maintenance handle for one compacted partition.
//!
//! ## Lookups
//!
//! A point lookup maps the key to its bucket, takes a shared lease on the
//! bucket, asks the sparse index for a start offset (0 when there is no
//! index), and scans forward.  Because keys in a compacted bucket ascend,
//! the scan stops at the first key greater than the query.
//!
//! Batch lookups sort and deduplicate the keys of each bucket and resolve
//! all of them in a single forward pass over the bucket.  The cursor never
//! moves backwards.
//!
//! ## Scans
//!
//! [`iterate`](PartitionAccessor::iterate) and
//! [`iterate_key_bucket`](PartitionAccessor::iterate_key_bucket) return a
//! lazy [`Scan`].  A scan holds the memory map of the bucket it is reading,
//! not the bucket's lock: a compaction running in the meantime swaps the
//! file underneath without disturbing the scan.
//!
//! ## Removal
//!
//! Removal rewrites each affected bucket through a temp file and drops the
//! bucket's index, both under the bucket's exclusive lock.  Indexes are not
//! rebuilt automatically.  A bucket with no records left is deleted.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::vec;

use tracing::{debug, info, warn};

use super::{PartitionContext, PartitionError, list_buckets};
use crate::cache::{FileAccessorCache, MappedFile};
use crate::codec::{self, RawRecord, ReadOutcome, RecordCursor};
use crate::encoding::Decode;
use crate::index;
use crate::utils::{remove_file_if_exists, run_parallel};
use crate::{StoreKey, StoreMeta, StoreValue};

// ------------------------------------------------------------------------------------------------
// Forward scan helpers
// ------------------------------------------------------------------------------------------------

/// Advance `cursor` to the record holding `key`.
///
/// Stops in front of the first greater key, so a following search for a
/// larger key can continue from there.  Records whose key does not decode
/// are skipped.
fn seek_key<'a, K: Decode + Ord>(
    cursor: &mut RecordCursor<'a>,
    key: &K,
    bucket: &Path,
) -> Option<RawRecord<'a>> {
    loop {
        let before = cursor.position();
        let raw = cursor.next_raw()?;
        match raw.key::<K>() {
            Ok(found) => match found.cmp(key) {
                Ordering::Less => continue,
                Ordering::Equal => return Some(raw),
                Ordering::Greater => {
                    cursor.restore(before);
                    return None;
                }
            },
            Err(error) => {
                warn!(
                    path = %bucket.display(),
                    offset = raw.offset,
                    %error,
                    "skipping corrupt record"
                );
            }
        }
    }
}

/// Decode the value of a record found by [`seek_key`].
fn decode_value<V: Decode>(raw: &RawRecord<'_>, bucket: &Path) -> Option<V> {
    match raw.value::<V>() {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(path = %bucket.display(), offset = raw.offset, %error, "skipping corrupt value");
            None
        }
    }
}

/// Find the values of `keys` in one bucket.
///
/// `keys` must be sorted and deduplicated.  Returns the pairs found, in
/// key order.
pub(crate) fn lookup_bucket<K, I, V, M>(
    ctx: &PartitionContext<K, I, V, M>,
    bucket: &Path,
    keys: Vec<K>,
) -> Result<Vec<(K, V)>, PartitionError>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    let Some(lease) = ctx.files.acquire(bucket)? else {
        return Ok(Vec::new());
    };
    let offsets = match index::resolve(&ctx.files, &ctx.indexes, &ctx.index, bucket)? {
        Some(sparse) => sparse.offsets_in_one_group(&keys),
        None => vec![0; keys.len()],
    };

    let mut cursor = RecordCursor::new(lease.bytes());
    let mut found = Vec::new();
    for (key, offset) in keys.into_iter().zip(offsets) {
        cursor.seek_forward(offset);
        if let Some(raw) = seek_key(&mut cursor, &key, bucket) {
            if let Some(value) = decode_value::<V>(&raw, bucket) {
                found.push((key, value));
            }
        }
    }
    Ok(found)
}

// ------------------------------------------------------------------------------------------------
// Lazy scan
// ------------------------------------------------------------------------------------------------

/// Lazy, ordered scan over a list of bucket files.
///
/// Yields the records of each bucket in file order, buckets in the order
/// given.  Missing buckets are skipped, corrupt records are logged and
/// skipped.  A failure to open a bucket is yielded as an error, after
/// which the scan continues with the next bucket.
pub struct Scan<T> {
    files: Arc<FileAccessorCache>,
    buckets: vec::IntoIter<PathBuf>,
    current: Option<(Arc<MappedFile>, u64)>,
    read: fn(&mut RecordCursor<'_>) -> ReadOutcome<T>,
}

impl<T> Scan<T> {
    fn new(
        files: Arc<FileAccessorCache>,
        buckets: Vec<PathBuf>,
        read: fn(&mut RecordCursor<'_>) -> ReadOutcome<T>,
    ) -> Self {
        Self {
            files,
            buckets: buckets.into_iter(),
            current: None,
            read,
        }
    }
}

impl<K: Decode, V: Decode> Scan<(K, V)> {
    pub(crate) fn records(files: Arc<FileAccessorCache>, buckets: Vec<PathBuf>) -> Self {
        Self::new(files, buckets, |cursor| cursor.next_record::<K, V>())
    }
}

impl<K: Decode> Scan<K> {
    pub(crate) fn keys(files: Arc<FileAccessorCache>, buckets: Vec<PathBuf>) -> Self {
        Self::new(files, buckets, |cursor| cursor.next_key::<K>().map(|(key, _)| key))
    }
}

impl<T> Iterator for Scan<T> {
    type Item = Result<T, PartitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((file, position)) = &mut self.current {
                let mut cursor = RecordCursor::at(file.bytes(), *position);
                let outcome = (self.read)(&mut cursor);
                *position = cursor.position();
                match outcome {
                    ReadOutcome::Record(item) => return Some(Ok(item)),
                    ReadOutcome::Corrupt { offset, error } => {
                        warn!(
                            path = %file.path().display(),
                            offset,
                            %error,
                            "skipping corrupt record"
                        );
                        continue;
                    }
                    ReadOutcome::EndOfStream => self.current = None,
                }
            }

            let bucket = self.buckets.next()?;
            match self.files.acquire(&bucket) {
                Ok(Some(lease)) => self.current = Some((lease.detach(), 0)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Accessor
// ------------------------------------------------------------------------------------------------

/// Reader and maintenance handle for one partition.
///
/// Cheap to create; all state lives in the store's caches.
pub struct PartitionAccessor<K, I, V, M> {
    ctx: Arc<PartitionContext<K, I, V, M>>,
    meta: M,
    dir: PathBuf,
}

impl<K, I, V, M> PartitionAccessor<K, I, V, M>
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
        Ok(Self { ctx, meta, dir })
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    /// Directory of this partition.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn bucket_of(&self, key: &K) -> Result<PathBuf, PartitionError> {
        self.ctx.bucket_path(&self.dir, key, &self.meta)
    }

    fn group_by_bucket(&self, keys: &[K]) -> Result<BTreeMap<PathBuf, Vec<K>>, PartitionError> {
        self.ctx.group_keys(&self.dir, &self.meta, keys)
    }

    /// Offset from which to scan `bucket` for `key`.
    fn start_offset(&self, bucket: &Path, key: &K) -> Result<u64, PartitionError> {
        let ctx = &self.ctx;
        Ok(index::resolve(&ctx.files, &ctx.indexes, &ctx.index, bucket)?
            .map_or(0, |sparse| sparse.lower_bound(key)))
    }

    // --------------------------------------------------------------------------------------------
    // Lookups
    // --------------------------------------------------------------------------------------------

    /// Value stored under `key`, or `None`.
    pub fn find(&self, key: &K) -> Result<Option<V>, PartitionError> {
        let bucket = self.bucket_of(key)?;
        let Some(lease) = self.ctx.files.acquire(&bucket)? else {
            return Ok(None);
        };
        let start = self.start_offset(&bucket, key)?;
        let mut cursor = RecordCursor::at(lease.bytes(), start);
        Ok(seek_key(&mut cursor, key, &bucket).and_then(|raw| decode_value::<V>(&raw, &bucket)))
    }

    /// Values of every key in `keys` that is present.
    ///
    /// Duplicate keys are looked up once.  Buckets are searched in
    /// parallel; the result is sorted by key.
    pub fn find_many(&self, keys: &[K]) -> Result<Vec<(K, V)>, PartitionError> {
        let groups: Vec<_> = self.group_by_bucket(keys)?.into_iter().collect();
        let per_bucket = run_parallel(groups, self.ctx.parallelism, |(bucket, keys)| {
            lookup_bucket(self.ctx.as_ref(), &bucket, keys)
        })?;
        let mut found: Vec<(K, V)> = per_bucket.into_iter().flatten().collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Whether `key` is present.  The value is not decoded.
    pub fn contains_key(&self, key: &K) -> Result<bool, PartitionError> {
        let bucket = self.bucket_of(key)?;
        let Some(lease) = self.ctx.files.acquire(&bucket)? else {
            return Ok(false);
        };
        let start = self.start_offset(&bucket, key)?;
        let mut cursor = RecordCursor::at(lease.bytes(), start);
        Ok(seek_key(&mut cursor, key, &bucket).is_some())
    }

    // --------------------------------------------------------------------------------------------
    // Scans
    // --------------------------------------------------------------------------------------------

    /// Every record of the partition, buckets in file-name order.
    pub fn iterate(&self) -> Result<Scan<(K, V)>, PartitionError> {
        Ok(Scan::records(Arc::clone(&self.ctx.files), list_buckets(&self.dir)?))
    }

    /// Every key of the partition, buckets in file-name order.
    pub fn iterate_keys(&self) -> Result<Scan<K>, PartitionError> {
        Ok(Scan::keys(Arc::clone(&self.ctx.files), list_buckets(&self.dir)?))
    }

    /// Every record of the bucket `key` maps to.
    pub fn iterate_key_bucket(&self, key: &K) -> Result<Scan<(K, V)>, PartitionError> {
        Ok(Scan::records(Arc::clone(&self.ctx.files), vec![self.bucket_of(key)?]))
    }

    // --------------------------------------------------------------------------------------------
    // Removal
    // --------------------------------------------------------------------------------------------

    /// Remove `key`.  Returns whether it was present.
    pub fn remove_key(&self, key: &K) -> Result<bool, PartitionError> {
        Ok(self.remove_keys(std::slice::from_ref(key))? > 0)
    }

    /// Remove every key in `keys`.  Returns the number of records removed.
    pub fn remove_keys(&self, keys: &[K]) -> Result<usize, PartitionError> {
        let groups: Vec<_> = self.group_by_bucket(keys)?.into_iter().collect();
        let removed: usize = run_parallel(groups, self.ctx.parallelism, |(bucket, doomed)| {
            self.rewrite_bucket(&bucket, |key| doomed.binary_search(key).is_err())
        })?
        .into_iter()
        .sum();
        info!(path = %self.dir.display(), removed, "keys removed");
        Ok(removed)
    }

    /// Keep only `key`, removing every other record of the partition.
    pub fn remove_all_except_key(&self, key: &K) -> Result<usize, PartitionError> {
        self.remove_all_except_keys(std::slice::from_ref(key))
    }

    /// Keep only the keys in `keys`, removing every other record of the
    /// partition.  Returns the number of records removed.
    pub fn remove_all_except_keys(&self, keys: &[K]) -> Result<usize, PartitionError> {
        let mut groups = self.group_by_bucket(keys)?;
        let work: Vec<(PathBuf, Vec<K>)> = list_buckets(&self.dir)?
            .into_iter()
            .map(|bucket| {
                let kept = groups.remove(&bucket).unwrap_or_default();
                (bucket, kept)
            })
            .collect();
        let removed: usize = run_parallel(work, self.ctx.parallelism, |(bucket, kept)| {
            self.rewrite_bucket(&bucket, |key| kept.binary_search(key).is_ok())
        })?
        .into_iter()
        .sum();
        info!(path = %self.dir.display(), removed, kept = keys.len(), "records pruned");
        Ok(removed)
    }

    /// Rewrite `bucket` keeping only the records whose key passes `keep`.
    ///
    /// Records whose key does not decode are dropped.  Returns the number
    /// of records removed.
    fn rewrite_bucket<F>(&self, bucket: &Path, keep: F) -> Result<usize, PartitionError>
    where
        F: Fn(&K) -> bool,
    {
        let ctx = &self.ctx;
        let (removed, deleted) = {
            let _guard = ctx.files.lock_exclusive(bucket)?;
            let Some(source) = MappedFile::open(bucket)? else {
                return Ok(0);
            };

            let mut cursor = RecordCursor::new(source.bytes());
            let mut kept = Vec::new();
            let mut removed = 0usize;
            let mut corrupt = 0usize;
            while let Some(raw) = cursor.next_raw() {
                match raw.key::<K>() {
                    Ok(key) if keep(&key) => kept.push(raw),
                    Ok(_) => removed += 1,
                    Err(error) => {
                        corrupt += 1;
                        warn!(
                            path = %bucket.display(),
                            offset = raw.offset,
                            %error,
                            "dropping corrupt record"
                        );
                    }
                }
            }
            if removed == 0 && corrupt == 0 {
                return Ok(0);
            }

            let deleted = kept.is_empty();
            if deleted {
                remove_file_if_exists(bucket)?;
            } else {
                codec::rewrite_atomically::<_, PartitionError, _>(bucket, |w| {
                    for raw in &kept {
                        w.write_raw(raw)?;
                    }
                    Ok(())
                })?;
            }
            index::builder::drop_bucket(&ctx.files, &ctx.indexes, bucket)?;
            (removed, deleted)
        };
        debug!(path = %bucket.display(), removed, deleted, "bucket rewritten");
        Ok(removed)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Regenerate the sparse index of every bucket.
    pub fn rebuild_index(&self) -> Result<usize, PartitionError> {
        self.ctx.rebuild_indexes(&self.dir)
    }

    /// Delete the index of the bucket `key` maps to.  Returns whether an
    /// index file existed.
    pub fn drop_bucket_index(&self, key: &K) -> Result<bool, PartitionError> {
        let bucket = self.bucket_of(key)?;
        Ok(index::builder::drop_bucket(&self.ctx.files, &self.ctx.indexes, &bucket)?)
    }

    /// Number of bucket files in the partition.
    pub fn count_data_files(&self) -> Result<usize, PartitionError> {
        Ok(list_buckets(&self.dir)?.len())
    }

    /// Delete the partition with all its buckets and indexes.
    pub fn drop_data(&self) -> Result<bool, PartitionError> {
        self.ctx.remove_tree(&self.dir)
    }
}
