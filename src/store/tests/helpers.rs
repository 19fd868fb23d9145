use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::partition::{CatalogPartition, FilePartition};
use crate::store::{Store, StoreOptions};

/// Page-view counters: keys are page names, inputs and values are view
/// counts, metadata is the day.
pub type ViewStore = Store<String, u64, u64, String>;
pub type ViewOptions = StoreOptions<String, u64, u64, String>;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `<root>/<day>/<first letter of the page>`, summing views.  No sweeper.
pub fn view_options(root: &Path) -> ViewOptions {
    init_tracing();
    StoreOptions {
        root_folder: root.to_path_buf(),
        catalog_partitions: vec![CatalogPartition::new("day", |day: &String| day.clone())],
        file_partition: Some(FilePartition::new("initial", |page: &String, _: &String| {
            page.chars().next().map_or_else(|| "_".to_string(), |c| c.to_string())
        })),
        merge_function: Some(Arc::new(|views: Vec<u64>| views.iter().sum::<u64>())),
        eviction_interval: None,
        ..StoreOptions::default()
    }
}

pub fn open(root: &Path) -> ViewStore {
    Store::open(view_options(root)).unwrap()
}

/// Bulk-load `views` into `day`, compact, and index.
pub fn load(store: &ViewStore, day: &str, views: &[(&str, u64)]) {
    let builder = store.create_builder(day.to_string()).unwrap();
    for (page, count) in views {
        builder.store(&page.to_string(), count).unwrap();
    }
    builder.compress().unwrap();
    builder.rebuild_index().unwrap();
}

pub fn s(text: &str) -> String {
    text.to_string()
}
