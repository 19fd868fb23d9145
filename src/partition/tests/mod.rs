mod tests_addressing;
mod tests_builder;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::FileAccessorCache;
use crate::compaction::Decompressor;
use crate::index::{IndexCache, IndexOptions};
use crate::partition::{CatalogPartition, FilePartition, PartitionContext, PartitionScheme};
use crate::postings::PostingList;

pub(super) use crate::store::tests::helpers::init_tracing;

/// Keys are strings, inputs are ids, values are posting lists, metadata
/// is a tenant name.
pub(super) type TestContext = PartitionContext<String, u64, PostingList, String>;

/// `<root>/<tenant>/b<0..4>`, the bucket picked by the key's byte sum.
pub(super) fn scheme(root: &Path) -> PartitionScheme<String, String> {
    PartitionScheme::new(
        root,
        vec![CatalogPartition::new("tenant", |tenant: &String| tenant.clone())],
        FilePartition::new("byte_sum", |key: &String, _: &String| {
            format!("b{}", key.bytes().map(u32::from).sum::<u32>() % 4)
        }),
    )
}

pub(super) fn context(root: &Path, index: IndexOptions) -> Arc<TestContext> {
    Arc::new(PartitionContext {
        scheme: scheme(root),
        merge: Arc::new(PostingList::from_ids),
        index,
        parallelism: 4,
        files: Arc::new(FileAccessorCache::new(Duration::from_secs(600))),
        indexes: IndexCache::new(),
    })
}

pub(super) fn expand() -> Decompressor<PostingList, u64> {
    Arc::new(|list: &PostingList| list.ids().to_vec())
}

pub(super) fn key(i: u64) -> String {
    format!("key-{i:06}")
}

pub(super) fn tenant() -> String {
    "acme".to_string()
}
