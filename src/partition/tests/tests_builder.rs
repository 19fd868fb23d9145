//! Partition builder tests.
//!
//! Coverage:
//! - `store()` + `compress()` group every input of a key into one value
//! - `store()` after `complete_adding()` → `InvalidState`
//! - concurrent `store()` from several threads loses nothing
//! - the first write to a bucket drops its stale index
//! - a builder over a partition that already holds data → `InvalidState`
//! - `rebuild_index()` on uncompacted data → `NotCompacted`

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::index::{IndexError, IndexOptions, index_path};
    use crate::partition::accessor::PartitionAccessor;
    use crate::partition::builder::PartitionBuilder;
    use crate::partition::list_buckets;
    use crate::partition::tests::{context, init_tracing, key, tenant};
    use crate::partition::PartitionError;

    // ----------------------------------------------------------------
    // Grouping
    // ----------------------------------------------------------------

    /// # Scenario
    /// Inputs stored in random key order come back grouped per key.
    ///
    /// # Starting environment
    /// Empty root, default index options.
    ///
    /// # Actions
    /// 1. Store ids `0..5` under each of 40 keys, interleaved across keys.
    /// 2. `compress()`.
    ///
    /// # Expected behavior
    /// 200 inputs read, 40 records written, and every key maps to the
    /// posting list `[0, 1, 2, 3, 4]`.
    #[test]
    fn compress_groups_inputs_by_key() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::default());
        let builder = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();

        for id in 0..5u64 {
            for i in (0..40).rev() {
                builder.store(&key(i), &id).unwrap();
            }
        }
        assert_eq!(builder.total_records(), 200);

        let stats = builder.compress().unwrap();
        assert_eq!(stats.records_read, 200);
        assert_eq!(stats.records_written, 40);
        assert_eq!(stats.corrupt_records, 0);
        assert_eq!(stats.buckets, list_buckets(builder.path()).unwrap().len());

        let accessor = PartitionAccessor::new(ctx, tenant()).unwrap();
        for i in 0..40 {
            let list = accessor.find(&key(i)).unwrap().unwrap();
            assert_eq!(list.ids(), &[0, 1, 2, 3, 4]);
        }
    }

    // ----------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------

    /// # Scenario
    /// Once adding is complete the builder refuses new inputs.
    ///
    /// # Actions
    /// 1. Store one input.
    /// 2. `complete_adding()` twice.
    /// 3. Store again.
    ///
    /// # Expected behavior
    /// The second `complete_adding()` is a no-op; the late store fails
    /// with `InvalidState`.
    #[test]
    fn store_after_complete_adding_fails() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::default());
        let builder = PartitionBuilder::new(ctx, tenant()).unwrap();

        builder.store(&key(1), &1).unwrap();
        builder.complete_adding().unwrap();
        builder.complete_adding().unwrap();

        let err = builder.store(&key(2), &2).unwrap_err();
        assert!(matches!(err, PartitionError::InvalidState(_)), "got {err:?}");
        assert_eq!(builder.total_records(), 1);
    }

    /// # Scenario
    /// Several threads append to the same builder at once.
    ///
    /// # Actions
    /// 1. 8 threads each store ids `t*1000..t*1000+250` under 10 shared keys.
    /// 2. `compress()`.
    ///
    /// # Expected behavior
    /// Every key holds the 200 ids stored for it.
    #[test]
    fn concurrent_stores_lose_nothing() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::default());
        let builder = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();

        std::thread::scope(|s| {
            for t in 0..8u64 {
                let builder = &builder;
                s.spawn(move || {
                    for n in 0..250u64 {
                        builder.store(&key(n % 10), &(t * 1000 + n)).unwrap();
                    }
                });
            }
        });
        assert_eq!(builder.total_records(), 2000);
        builder.compress().unwrap();

        let accessor = PartitionAccessor::new(ctx, tenant()).unwrap();
        let mut expected: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for t in 0..8u64 {
            for n in 0..250u64 {
                expected.entry(key(n % 10)).or_default().push(t * 1000 + n);
            }
        }
        for (k, mut ids) in expected {
            ids.sort_unstable();
            assert_eq!(accessor.find(&k).unwrap().unwrap().ids(), ids.as_slice());
        }
    }

    // ----------------------------------------------------------------
    // Index interaction
    // ----------------------------------------------------------------

    /// # Scenario
    /// Loading into an indexed bucket invalidates the bucket's index.
    ///
    /// # Starting environment
    /// A compacted, indexed partition, plus a second builder created while
    /// the partition was still empty.
    ///
    /// # Actions
    /// 1. Store one input under an existing key through the second builder.
    ///
    /// # Expected behavior
    /// The index file of that key's bucket is gone; other buckets keep
    /// theirs.
    #[test]
    fn first_write_drops_stale_index() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::default());
        let builder = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();
        let late = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();
        for i in 0..100 {
            builder.store(&key(i), &i).unwrap();
        }
        builder.compress().unwrap();
        assert!(builder.rebuild_index().unwrap() > 0);

        let target = ctx.bucket_path(builder.path(), &key(7), &tenant()).unwrap();
        let others: Vec<_> = list_buckets(builder.path())
            .unwrap()
            .into_iter()
            .filter(|b| *b != target)
            .collect();
        assert!(index_path(&target).exists());

        late.store(&key(7), &1000).unwrap();

        assert!(!index_path(&target).exists());
        for bucket in others {
            assert!(index_path(&bucket).exists(), "{} lost its index", bucket.display());
        }
    }

    /// # Scenario
    /// A builder is refused over a partition that already holds data.
    ///
    /// # Starting environment
    /// A compacted partition of 10 keys.
    ///
    /// # Actions
    /// 1. Create another builder for the same partition.
    /// 2. Remove the partition and try again.
    ///
    /// # Expected behavior
    /// The first attempt fails with `InvalidState` and leaves every value
    /// readable.  Once the partition is gone a builder can be created.
    #[test]
    fn builder_refuses_partition_with_data() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::default());
        let builder = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();
        for i in 0..10 {
            builder.store(&key(i), &i).unwrap();
        }
        builder.compress().unwrap();

        let err = PartitionBuilder::new(Arc::clone(&ctx), tenant()).err().unwrap();
        assert!(matches!(err, PartitionError::InvalidState(_)), "got {err:?}");

        let accessor = PartitionAccessor::new(Arc::clone(&ctx), tenant()).unwrap();
        for i in 0..10 {
            assert_eq!(accessor.find(&key(i)).unwrap().unwrap().ids(), &[i]);
        }

        assert!(accessor.drop_data().unwrap());
        assert!(PartitionBuilder::new(ctx, tenant()).is_ok());
    }

    /// # Scenario
    /// Indexing a bucket that still holds raw inputs is refused.
    ///
    /// # Actions
    /// 1. Store the same key twice, `complete_adding()`, no compaction.
    /// 2. `rebuild_index()`.
    ///
    /// # Expected behavior
    /// `NotCompacted`, and no index file is written.
    #[test]
    fn rebuild_index_requires_compaction() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::default());
        let builder = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();
        builder.store(&key(3), &1).unwrap();
        builder.store(&key(3), &2).unwrap();
        builder.complete_adding().unwrap();

        let err = builder.rebuild_index().unwrap_err();
        assert!(
            matches!(err, PartitionError::Index(IndexError::NotCompacted { .. })),
            "got {err:?}"
        );
        let bucket = ctx.bucket_path(builder.path(), &key(3), &tenant()).unwrap();
        assert!(!index_path(&bucket).exists());
    }

    /// # Scenario
    /// With indexing disabled, rebuilding writes nothing.
    #[test]
    fn rebuild_index_disabled_is_noop() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), IndexOptions::disabled());
        let builder = PartitionBuilder::new(Arc::clone(&ctx), tenant()).unwrap();
        for i in 0..10 {
            builder.store(&key(i), &i).unwrap();
        }
        builder.compress().unwrap();

        assert_eq!(builder.rebuild_index().unwrap(), 0);
        assert!(!builder.path().join("__indexes__").exists());
    }
}
