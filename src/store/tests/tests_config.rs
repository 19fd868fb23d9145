use std::time::Duration;

use tempfile::TempDir;

use super::helpers::{ViewOptions, view_options};
use crate::index::{IndexOptions, IndexStrategy};
use crate::partition::CatalogPartition;
use crate::store::{Store, StoreError};

fn assert_invalid(options: ViewOptions, needle: &str) {
    match Store::open(options) {
        Err(StoreError::InvalidConfig(msg)) => {
            assert!(msg.contains(needle), "expected '{needle}' in '{msg}'")
        }
        Err(other) => panic!("expected InvalidConfig, got {other:?}"),
        Ok(_) => panic!("expected InvalidConfig mentioning '{needle}'"),
    }
}

#[test]
fn defaults_are_documented_values() {
    let dir = TempDir::new().unwrap();
    let options = view_options(dir.path());
    assert_eq!(options.max_degree_of_parallelism, 4);
    assert_eq!(options.file_cache_expiration, Duration::from_secs(30 * 60));
    assert_eq!(options.index, IndexOptions::default());
    assert!(options.clock.is_none());

    let bare = ViewOptions::default();
    assert_eq!(bare.eviction_interval, Some(Duration::from_secs(60)));
    assert!(bare.file_partition.is_none());
    assert!(bare.merge_function.is_none());
}

#[test]
fn missing_root_folder() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options.root_folder = Default::default();
    assert_invalid(options, "root_folder");
}

#[test]
fn missing_file_partition() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options.file_partition = None;
    assert_invalid(options, "file_partition");
}

#[test]
fn missing_merge_function() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options.merge_function = None;
    assert_invalid(options, "merge_function");
}

#[test]
fn unnamed_catalog_partition() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options
        .catalog_partitions
        .push(CatalogPartition::new("  ", |day: &String| day.clone()));
    assert_invalid(options, "empty name");
}

#[test]
fn zero_parallelism() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options.max_degree_of_parallelism = 0;
    assert_invalid(options, "max_degree_of_parallelism");
}

#[test]
fn zero_expiration() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options.file_cache_expiration = Duration::ZERO;
    assert_invalid(options, "file_cache_expiration");
}

#[test]
fn zero_eviction_interval() {
    let dir = TempDir::new().unwrap();
    let mut options = view_options(dir.path());
    options.eviction_interval = Some(Duration::ZERO);
    assert_invalid(options, "eviction_interval");
}

#[test]
fn zero_index_parameters() {
    for strategy in [IndexStrategy::Step(0), IndexStrategy::AbsoluteCount(0)] {
        let dir = TempDir::new().unwrap();
        let mut options = view_options(dir.path());
        options.index.strategy = strategy;
        assert_invalid(options, "must be >= 1");
    }
}

#[test]
fn open_creates_missing_root() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("nested").join("root");
    let store = Store::open(view_options(&root)).unwrap();
    assert!(root.is_dir());
    assert_eq!(store.root(), root.as_path());
}
