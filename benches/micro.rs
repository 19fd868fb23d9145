//! Micro-benchmarks for partitiondb core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- find      # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use std::path::Path;
use std::sync::Arc;

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use partitiondb::postings::{FieldDescriptor, TokenIndex};
use partitiondb::{
    CatalogPartition, FilePartition, IndexOptions, IndexStrategy, Store, StoreOptions,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

type Counters = Store<String, u64, u64, String>;

/// Number of bucket files per partition.
const BUCKETS: u64 = 16;

/// Format a zero-padded key.
fn make_key(i: u64) -> String {
    format!("key-{i:012}")
}

fn day() -> String {
    "2024-05-01".to_string()
}

/// Open a counter store: one partition per day, `BUCKETS` bucket files
/// picked by key suffix, values summed.
fn open(dir: &Path, index: IndexOptions) -> Counters {
    Store::open(StoreOptions {
        root_folder: dir.to_path_buf(),
        catalog_partitions: vec![CatalogPartition::new("day", |d: &String| d.clone())],
        file_partition: Some(FilePartition::new("suffix", |key: &String, _: &String| {
            let suffix: u64 = key.bytes().rev().take(4).map(u64::from).sum();
            format!("{:02}", suffix % BUCKETS)
        })),
        merge_function: Some(Arc::new(|inputs: Vec<u64>| inputs.iter().sum::<u64>())),
        index,
        eviction_interval: None,
        ..StoreOptions::default()
    })
    .expect("open")
}

/// Load `count` keys with `repeats` inputs each, compact, and index.
fn prepopulate(store: &Counters, count: u64, repeats: u64) {
    let builder = store.create_builder(day()).unwrap();
    for r in 0..repeats {
        for i in 0..count {
            builder.store(&make_key(i), &r).unwrap();
        }
    }
    builder.compress().unwrap();
    builder.rebuild_index().unwrap();
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// Benchmark group for appending inputs (`store`).
///
/// **Scenario:** Appends inputs for sequential keys into an open builder.
///
/// **What it measures:** The per-input cost of key addressing, encoding,
/// and a buffered append. No compaction is involved.
fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append", |b| {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), IndexOptions::default());
        let builder = store.create_builder(day()).unwrap();
        let mut seq = 0u64;

        b.iter(|| {
            builder.store(black_box(&make_key(seq)), black_box(&seq)).unwrap();
            seq += 1;
        });
    });

    group.finish();
}

/// Benchmark group for compaction.
///
/// ## `compress/{1000,10000}`
///
/// **Scenario:** N keys with 4 inputs each are appended, then compacted.
///
/// **What it measures:** Grouping, merging, and the sorted atomic rewrite
/// of every bucket, across worker threads.  Sample size is reduced because
/// each iteration rewrites the whole partition.
fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    for &count in &[1_000u64, 10_000] {
        group.bench_function(BenchmarkId::new("compress", count), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let store = open(dir.path(), IndexOptions::default());
                    let builder = store.create_builder(day()).unwrap();
                    for r in 0..4 {
                        for i in 0..count {
                            builder.store(&make_key(i), &r).unwrap();
                        }
                    }
                    (dir, store, builder)
                },
                |(_dir, _store, builder)| {
                    black_box(builder.compress().unwrap());
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

/// Benchmark group for folding new inputs into a compacted partition.
///
/// **Scenario:** 10,000 compacted keys; 100 new inputs spread over all
/// buckets are merged in.
///
/// **What it measures:** Decompressing and rewriting the touched buckets,
/// plus reindexing them.
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);

    group.bench_function("fold_100", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let store = open(dir.path(), IndexOptions::default());
                prepopulate(&store, 10_000, 1);
                (dir, store)
            },
            |(_dir, store)| {
                let merge = store
                    .create_merge_accessor(day(), Arc::new(|sum: &u64| vec![*sum]))
                    .unwrap();
                for i in (0..10_000).step_by(100) {
                    merge.store(&make_key(i), &1).unwrap();
                }
                black_box(merge.compress().unwrap());
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

/// Benchmark group for point lookups (`find`).
///
/// ## `hit/{disabled,step_16,count_64}`
///
/// **Scenario:** Random lookups of present keys among 20,000 compacted keys
/// under different index configurations.
///
/// **What it measures:** The forward-scan length saved by the sparse index.
/// Without an index every lookup scans its bucket from offset 0.
///
/// ## `miss/count_64`
///
/// **Scenario:** Lookups of keys above the stored range.
fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");
    let configurations = [
        ("disabled", IndexOptions::disabled()),
        (
            "step_16",
            IndexOptions {
                strategy: IndexStrategy::Step(16),
                ..IndexOptions::default()
            },
        ),
        ("count_64", IndexOptions::default()),
    ];

    for (label, index) in configurations {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), index);
        prepopulate(&store, 20_000, 1);
        let accessor = store.create_accessor(day()).unwrap();
        let mut seq = 0u64;

        group.bench_function(BenchmarkId::new("hit", label), |b| {
            b.iter(|| {
                let key = make_key(seq.wrapping_mul(7919) % 20_000);
                black_box(accessor.find(black_box(&key)).unwrap());
                seq += 1;
            });
        });
    }

    {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), IndexOptions::default());
        prepopulate(&store, 20_000, 1);
        let accessor = store.create_accessor(day()).unwrap();
        let mut seq = 0u64;

        group.bench_function(BenchmarkId::new("miss", "count_64"), |b| {
            b.iter(|| {
                let key = make_key(1_000_000 + seq);
                black_box(accessor.find(black_box(&key)).unwrap());
                seq += 1;
            });
        });
    }

    group.finish();
}

/// Benchmark group for batch lookups (`find_many`).
///
/// **Scenario:** 1,000 random keys resolved at once against 20,000
/// compacted keys.
///
/// **What it measures:** The single-pass, per-bucket batch path.
fn bench_find_many(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_many");
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), IndexOptions::default());
    prepopulate(&store, 20_000, 1);
    let accessor = store.create_accessor(day()).unwrap();
    let keys: Vec<String> = (0..1_000u64).map(|i| make_key(i * 19 % 20_000)).collect();

    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("batch_1000", |b| {
        b.iter(|| black_box(accessor.find_many(black_box(&keys)).unwrap()));
    });

    group.finish();
}

/// Benchmark group for full partition scans (`bypass`).
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), IndexOptions::default());
    prepopulate(&store, 20_000, 1);

    group.throughput(Throughput::Elements(20_000));
    group.bench_function("bypass_20000", |b| {
        b.iter(|| {
            let n = store.bypass(&day()).unwrap().filter_map(Result::ok).count();
            black_box(n)
        });
    });

    group.finish();
}

// ================================================================================================
// Token search
// ================================================================================================

struct Article {
    id: u64,
    body: String,
}

/// Benchmark group for posting-list search.
///
/// **Scenario:** 5,000 short synthetic articles over a 200-word vocabulary,
/// queried with three tokens.
///
/// **What it measures:** Token lookups, posting-list decoding, and scoring.
fn bench_token_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_search");
    let dir = TempDir::new().unwrap();
    let index = TokenIndex::with_options(
        StoreOptions {
            root_folder: dir.path().to_path_buf(),
            eviction_interval: None,
            ..StoreOptions::default()
        },
        vec![FieldDescriptor::new("body", |a: &Article| a.body.clone()).with_exact_match(true)],
        |a: &Article| a.id,
    )
    .unwrap();

    let writer = index.writer().unwrap();
    for id in 0..5_000u64 {
        let body: Vec<String> = (0..8).map(|w| format!("w{}", (id * 31 + w * 7) % 200)).collect();
        writer
            .add(&Article {
                id,
                body: body.join(" "),
            })
            .unwrap();
    }
    writer.complete().unwrap();

    for exact in [false, true] {
        group.bench_function(BenchmarkId::new("three_tokens", exact), |b| {
            b.iter(|| black_box(index.search(black_box("w7 w14 w21"), exact).unwrap()));
        });
    }

    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(
    benches,
    bench_store,
    bench_compress,
    bench_merge,
    bench_find,
    bench_find_many,
    bench_scan,
    bench_token_search,
);

criterion_main!(benches);
