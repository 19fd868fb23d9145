//! Cross-partition key lookup.
//!
//! A [`SearchRequest`] lists `(metadata, keys)` pairs.  Iterating the
//! [`SearchResults`] resolves one partition at a time and, inside it, one
//! bucket at a time: the keys of a bucket are looked up in a single
//! forward pass and their hits are yielded before the next bucket is
//! touched.  Stopping early skips the remaining buckets entirely.

use std::path::PathBuf;
use std::slice;
use std::sync::Arc;
use std::vec;

use super::StoreError;
use crate::partition::PartitionContext;
use crate::partition::accessor::lookup_bucket;
use crate::{StoreKey, StoreMeta, StoreValue};

/// Keys to look up, grouped by the partition they live in.
#[derive(Debug, Clone)]
pub struct SearchRequest<K, M> {
    parts: Vec<(M, Vec<K>)>,
}

impl<K, M> Default for SearchRequest<K, M> {
    fn default() -> Self {
        Self { parts: Vec::new() }
    }
}

impl<K, M> SearchRequest<K, M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `keys` in the partition identified by `meta`.
    pub fn with(mut self, meta: M, keys: impl IntoIterator<Item = K>) -> Self {
        self.parts.push((meta, keys.into_iter().collect()));
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<K, M> FromIterator<(M, Vec<K>)> for SearchRequest<K, M> {
    fn from_iter<T: IntoIterator<Item = (M, Vec<K>)>>(iter: T) -> Self {
        Self {
            parts: iter.into_iter().collect(),
        }
    }
}

/// Restartable, lazily evaluated result of [`Store::search`](super::Store::search).
pub struct SearchResults<K, I, V, M> {
    ctx: Arc<PartitionContext<K, I, V, M>>,
    request: SearchRequest<K, M>,
}

impl<K, I, V, M> SearchResults<K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    pub(crate) fn new(
        ctx: Arc<PartitionContext<K, I, V, M>>,
        request: SearchRequest<K, M>,
    ) -> Self {
        Self { ctx, request }
    }

    /// Start a fresh pass over the results.
    ///
    /// Yields `(key, value, metadata)` for every requested key that is
    /// present, partitions in request order, buckets of a partition in
    /// file-name order, keys of a bucket in ascending order.  Duplicate
    /// keys within one partition are yielded once.
    pub fn iter(&self) -> SearchIter<'_, K, I, V, M> {
        SearchIter {
            ctx: &self.ctx,
            parts: self.request.parts.iter(),
            meta: None,
            buckets: Vec::new().into_iter(),
            hits: Vec::new().into_iter(),
        }
    }
}

impl<'a, K, I, V, M> IntoIterator for &'a SearchResults<K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    type Item = Result<(K, V, M), StoreError>;
    type IntoIter = SearchIter<'a, K, I, V, M>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over [`SearchResults`].
pub struct SearchIter<'a, K, I, V, M> {
    ctx: &'a PartitionContext<K, I, V, M>,
    parts: slice::Iter<'a, (M, Vec<K>)>,
    meta: Option<&'a M>,
    buckets: vec::IntoIter<(PathBuf, Vec<K>)>,
    hits: vec::IntoIter<(K, V)>,
}

impl<K, I, V, M> Iterator for SearchIter<'_, K, I, V, M>
where
    K: StoreKey,
    I: StoreValue,
    V: StoreValue,
    M: StoreMeta,
{
    type Item = Result<(K, V, M), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(meta) = self.meta {
                if let Some((key, value)) = self.hits.next() {
                    return Some(Ok((key, value, meta.clone())));
                }
            }

            if let Some((bucket, keys)) = self.buckets.next() {
                match lookup_bucket(self.ctx, &bucket, keys) {
                    Ok(hits) => self.hits = hits.into_iter(),
                    Err(e) => return Some(Err(e.into())),
                }
                continue;
            }

            let (meta, keys) = self.parts.next()?;
            let planned = self
                .ctx
                .scheme
                .catalog_path(meta)
                .and_then(|dir| self.ctx.group_keys(&dir, meta, keys));
            match planned {
                Ok(groups) => {
                    self.meta = Some(meta);
                    self.buckets = groups.into_iter().collect::<Vec<_>>().into_iter();
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
