//! # partitiondb
//!
//! An embeddable, partitioned **append-then-compact** key-value store with
//! a sparse secondary index.  Data is spread over a directory tree chosen
//! by caller-supplied partition functions; each bucket file is bulk-loaded,
//! compacted into one sorted record per key, and sampled into a small
//! index that turns point lookups into a short forward scan.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use partitiondb::{CatalogPartition, FilePartition, Store, StoreOptions};
//!
//! // Inputs are page views, the compacted value is the total per key.
//! let options = StoreOptions::<String, u64, u64, String> {
//!     root_folder: "/tmp/views".into(),
//!     catalog_partitions: vec![CatalogPartition::new("day", |day: &String| day.clone())],
//!     file_partition: Some(FilePartition::new("initial", |key: &String, _: &String| {
//!         key.chars().next().unwrap_or('_').to_string()
//!     })),
//!     merge_function: Some(Arc::new(|views: Vec<u64>| views.iter().sum::<u64>())),
//!     ..StoreOptions::default()
//! };
//! let store = Store::open(options).unwrap();
//!
//! // Load
//! let builder = store.create_builder("2024-05-01".to_string()).unwrap();
//! builder.store(&"home".to_string(), &3).unwrap();
//! builder.store(&"about".to_string(), &1).unwrap();
//! builder.store(&"home".to_string(), &2).unwrap();
//! builder.compress().unwrap();
//! builder.rebuild_index().unwrap();
//!
//! // Read
//! let pages = store.create_accessor("2024-05-01".to_string()).unwrap();
//! assert_eq!(pages.find(&"home".to_string()).unwrap(), Some(5));
//!
//! store.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Pluggable partitioning**: metadata picks the directory, key and
//!   metadata pick the bucket file.
//! - **Parallel compaction**: buckets are grouped, merged, and atomically
//!   rewritten on a pool of worker threads.
//! - **Sparse indexes**: step or fixed-count sampling, cached in memory.
//! - **Incremental merges**: fold new inputs into compacted data.
//! - **Shared file cache**: memory-mapped handles with keyed read/write
//!   locks and idle eviction.
//! - **Token search**: a posting-list index with position-aware scoring,
//!   see [`postings`].

pub mod cache;
pub mod codec;
pub mod compaction;
pub mod encoding;
pub mod index;
pub mod partition;
pub mod postings;
pub mod store;
mod utils;

pub use cache::{Clock, FileAccessorCache, ManualClock, SystemClock};
pub use compaction::{CompactionStats, Decompressor, MergeFunction};
pub use encoding::{Decode, Encode, EncodingError};
pub use index::{IndexOptions, IndexStrategy};
pub use partition::accessor::{PartitionAccessor, Scan};
pub use partition::builder::PartitionBuilder;
pub use partition::merge::PartitionMergeBuilder;
pub use partition::{CatalogPartition, FilePartition, PartitionError};
pub use store::{SearchRequest, SearchResults, Store, StoreError, StoreOptions};

// ------------------------------------------------------------------------------------------------
// Type bounds
// ------------------------------------------------------------------------------------------------

/// Bound for keys: totally ordered, cloneable, and encodable.
///
/// Implemented for every type meeting the bounds.
pub trait StoreKey: Ord + Clone + Encode + Decode + Send + Sync + 'static {}

impl<T> StoreKey for T where T: Ord + Clone + Encode + Decode + Send + Sync + 'static {}

/// Bound for inputs and compacted values.
pub trait StoreValue: Encode + Decode + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Encode + Decode + Send + Sync + 'static {}

/// Bound for partition metadata.
pub trait StoreMeta: Clone + Send + Sync + 'static {}

impl<T> StoreMeta for T where T: Clone + Send + Sync + 'static {}
