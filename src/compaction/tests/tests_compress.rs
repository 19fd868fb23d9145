//! Plain bucket compaction.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tempfile::TempDir;

use crate::cache::FileAccessorCache;
use crate::codec::{self, ReadOutcome, RecordCursor};
use crate::compaction::*;
use crate::index::{self, IndexCache, IndexStrategy};

fn sum() -> MergeFunction<u64, u64> {
    Arc::new(|inputs: Vec<u64>| inputs.into_iter().sum())
}

fn append(path: &Path, pairs: &[(String, u64)]) {
    let mut w = codec::open_append(path).unwrap();
    for (k, v) in pairs {
        w.write_record(k, v).unwrap();
    }
    w.flush().unwrap();
}

fn read_all(path: &Path) -> Vec<(String, u64)> {
    let bytes = fs::read(path).unwrap();
    let mut cursor = RecordCursor::new(&bytes);
    let mut out = Vec::new();
    while let ReadOutcome::Record(pair) = cursor.next_record::<String, u64>() {
        out.push(pair);
    }
    out
}

fn files() -> FileAccessorCache {
    FileAccessorCache::new(Duration::from_secs(60))
}

#[test]
fn groups_merges_and_sorts() {
    let dir = TempDir::new().unwrap();
    let bucket = dir.path().join("b");
    append(
        &bucket,
        &[
            ("c".into(), 1),
            ("a".into(), 2),
            ("c".into(), 3),
            ("b".into(), 4),
            ("a".into(), 5),
        ],
    );

    let stats = compress_bucket::<String, u64, u64>(&files(), &IndexCache::new(), &sum(), &bucket).unwrap();

    assert_eq!(stats.records_read, 5);
    assert_eq!(stats.records_written, 3);
    assert_eq!(
        read_all(&bucket),
        vec![("a".into(), 7), ("b".into(), 4), ("c".into(), 4)]
    );
}

#[test]
fn inputs_reach_merge_in_append_order() {
    let dir = TempDir::new().unwrap();
    let bucket = dir.path().join("b");
    append(&bucket, &[("k".into(), 3), ("x".into(), 0), ("k".into(), 1), ("k".into(), 2)]);

    let first: MergeFunction<u64, u64> = Arc::new(|inputs: Vec<u64>| inputs[0] * 100 + inputs[inputs.len() - 1]);
    compress_bucket::<String, u64, u64>(&files(), &IndexCache::new(), &first, &bucket).unwrap();
    assert_eq!(read_all(&bucket)[0], ("k".into(), 302));
}

#[test]
fn random_multiset_roundtrip() {
    let dir = TempDir::new().unwrap();
    let bucket = dir.path().join("b");
    let mut rng = rand::rng();
    let mut expected: BTreeMap<String, u64> = BTreeMap::new();
    let mut pairs = Vec::new();
    for _ in 0..2_000 {
        let key = format!("key-{:04}", rng.random_range(0..300));
        let value = rng.random_range(0..1_000u64);
        *expected.entry(key.clone()).or_default() += value;
        pairs.push((key, value));
    }
    append(&bucket, &pairs);

    compress_bucket::<String, u64, u64>(&files(), &IndexCache::new(), &sum(), &bucket).unwrap();

    let actual = read_all(&bucket);
    assert_eq!(actual, expected.into_iter().collect::<Vec<_>>());
}

#[test]
fn corrupt_inputs_are_skipped() {
    let dir = TempDir::new().unwrap();
    let bucket = dir.path().join("b");
    append(&bucket, &[("a".into(), 1)]);
    {
        let mut w = codec::open_append(&bucket).unwrap();
        w.write_record(&"bad".to_string(), &vec![1u8]).unwrap();
        w.flush().unwrap();
    }
    append(&bucket, &[("a".into(), 2)]);

    let stats = compress_bucket::<String, u64, u64>(&files(), &IndexCache::new(), &sum(), &bucket).unwrap();
    assert_eq!(stats.corrupt_records, 1);
    assert_eq!(read_all(&bucket), vec![("a".into(), 3)]);
}

#[test]
fn missing_bucket_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let stats = compress_bucket::<String, u64, u64>(
        &files(),
        &IndexCache::new(),
        &sum(),
        &dir.path().join("absent"),
    )
    .unwrap();
    assert_eq!(stats, CompactionStats::default());
    assert!(!dir.path().join("absent").exists());
}

#[test]
fn compaction_drops_stale_index() {
    let dir = TempDir::new().unwrap();
    let bucket = dir.path().join("b");
    append(&bucket, &[("a".into(), 1), ("b".into(), 1), ("c".into(), 1)]);
    let files = files();
    let indexes = IndexCache::new();

    compress_bucket::<String, u64, u64>(&files, &indexes, &sum(), &bucket).unwrap();
    index::builder::rebuild_bucket::<String>(&files, &indexes, IndexStrategy::Step(1), &bucket).unwrap();
    assert!(index::index_path(&bucket).exists());

    append(&bucket, &[("a".into(), 1)]);
    compress_bucket::<String, u64, u64>(&files, &indexes, &sum(), &bucket).unwrap();
    assert!(!index::index_path(&bucket).exists());
}

#[test]
fn parallel_buckets_sum_statistics() {
    let dir = TempDir::new().unwrap();
    let files = files();
    let indexes = IndexCache::new();
    let merge = sum();
    let buckets: Vec<_> = (0..8)
        .map(|i| {
            let bucket = dir.path().join(format!("b{i}"));
            append(&bucket, &[("x".into(), i), ("y".into(), 1), ("x".into(), 1)]);
            bucket
        })
        .collect();

    let stats = compress_buckets(dir.path(), buckets.clone(), 4, |bucket| {
        compress_bucket::<String, u64, u64>(&files, &indexes, &merge, &bucket)
    })
    .unwrap();

    assert_eq!(stats.buckets, 8);
    assert_eq!(stats.records_read, 24);
    assert_eq!(stats.records_written, 16);
    for (i, bucket) in buckets.iter().enumerate() {
        assert_eq!(read_all(bucket), vec![("x".into(), i as u64 + 1), ("y".into(), 1)]);
    }
}

#[test]
fn parallel_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let buckets: Vec<_> = (0..4).map(|i| dir.path().join(format!("b{i}"))).collect();
    let err = compress_buckets(dir.path(), buckets, 2, |bucket| {
        if bucket.ends_with("b2") {
            Err(CompactionError::Internal("boom".into()))
        } else {
            Ok(CompactionStats::default())
        }
    })
    .unwrap_err();
    assert!(matches!(err, CompactionError::Internal(ref m) if m == "boom"));
}
