//! Catalog paths, bucket names, and segment sanitizing.

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use super::{key, scheme, tenant};
use crate::partition::*;

#[derive(Clone)]
struct Event {
    region: &'static str,
    day: &'static str,
}

fn two_level() -> PartitionScheme<u64, Event> {
    PartitionScheme::new(
        "/data",
        vec![
            CatalogPartition::new("region", |e: &Event| e.region.to_string()),
            CatalogPartition::new("day", |e: &Event| e.day.to_string()),
        ],
        FilePartition::new("mod8", |k: &u64, _: &Event| format!("{:02}", k % 8)),
    )
}

#[test]
fn catalog_segments_fold_in_order() {
    let scheme = two_level();
    let meta = Event {
        region: "eu",
        day: "2024-05-01",
    };
    assert_eq!(
        scheme.catalog_path(&meta).unwrap(),
        PathBuf::from("/data/eu/2024-05-01")
    );
    assert_eq!(scheme.bucket_name(&13, &meta).unwrap(), "05");
}

#[test]
fn addressing_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let scheme = scheme(dir.path());
    for i in 0..50 {
        let a = scheme.bucket_name(&key(i), &tenant()).unwrap();
        let b = scheme.bucket_name(&key(i), &tenant()).unwrap();
        assert_eq!(a, b);
    }
    assert!(!dir.path().join(tenant()).exists(), "addressing must not touch the disk");
}

#[test]
fn unsafe_characters_are_replaced() {
    assert_eq!(sanitize_segment("a/b\\c", "p").unwrap(), "a_b_c");
    assert_eq!(sanitize_segment("x:y*z?", "p").unwrap(), "x_y_z_");
    assert_eq!(sanitize_segment("  padded \t", "p").unwrap(), "padded");
    assert_eq!(sanitize_segment("tab\u{1}char", "p").unwrap(), "tab_char");
}

#[test]
fn unusable_segments_are_rejected() {
    for raw in ["", "   ", ".", "..", "__indexes__", "__merge__", "bucket.tmp"] {
        let err = sanitize_segment(raw, "tenant").unwrap_err();
        assert!(
            matches!(err, PartitionError::InvalidScheme(_)),
            "{raw:?} should be rejected, got {err:?}"
        );
    }
}

#[test]
fn empty_catalog_output_is_a_scheme_error() {
    let scheme = two_level();
    let meta = Event {
        region: "eu",
        day: " ",
    };
    let err = scheme.catalog_path(&meta).unwrap_err();
    assert!(err.to_string().contains("'day'"), "error should name the partition: {err}");
}

#[test]
fn list_buckets_skips_folders_and_temp_files() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::write(root.join("b2"), b"").unwrap();
    fs::write(root.join("b0"), b"").unwrap();
    fs::write(root.join("b1.tmp"), b"").unwrap();
    fs::create_dir_all(root.join("__indexes__")).unwrap();
    fs::write(root.join("__indexes__").join("b0"), b"").unwrap();

    let buckets = list_buckets(root).unwrap();
    assert_eq!(buckets, vec![root.join("b0"), root.join("b2")]);
}

#[test]
fn list_buckets_of_missing_partition_is_empty() {
    let dir = TempDir::new().unwrap();
    assert!(list_buckets(&dir.path().join("nope")).unwrap().is_empty());
}
