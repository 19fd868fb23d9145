//! Lower-bound search over sample arrays.

use rand::Rng;

use crate::index::*;

fn index(samples: &[(u64, u64)]) -> SparseIndex<u64> {
    SparseIndex::from_entries(
        samples
            .iter()
            .map(|&(key, offset)| IndexEntry { key, offset })
            .collect(),
    )
}

#[test]
fn exact_sample_hit() {
    let idx = index(&[(10, 0), (20, 100), (30, 200)]);
    assert_eq!(idx.lower_bound(&20), 100);
}

#[test]
fn between_samples_uses_smaller_one() {
    let idx = index(&[(10, 0), (20, 100), (30, 200)]);
    assert_eq!(idx.lower_bound(&25), 100);
    assert_eq!(idx.lower_bound(&99), 200);
}

#[test]
fn below_first_sample_is_offset_zero() {
    let idx = index(&[(10, 40), (20, 100)]);
    assert_eq!(idx.lower_bound(&5), 0);
}

#[test]
fn empty_index_is_offset_zero() {
    let idx = index(&[]);
    assert!(idx.is_empty());
    assert_eq!(idx.lower_bound(&5), 0);
}

#[test]
fn duplicate_sample_keys_prefer_lowest_offset() {
    let idx = index(&[(20, 300), (10, 0), (20, 100), (20, 200)]);
    assert_eq!(idx.lower_bound(&20), 100);
    assert_eq!(idx.lower_bound(&21), 100);
    assert_eq!(idx.entries()[1].offset, 100);
}

#[test]
fn one_group_matches_independent_lookup() {
    let idx = index(&[(10, 0), (20, 100), (30, 200), (40, 300)]);
    let keys = [1, 10, 15, 20, 20, 35, 40, 99];
    assert_eq!(
        idx.offsets_in_one_group(&keys),
        idx.offsets_independent(&keys)
    );
    assert_eq!(
        idx.offsets_in_one_group(&keys),
        vec![0, 0, 0, 100, 100, 200, 300, 300]
    );
}

#[test]
fn one_group_offsets_are_monotonic() {
    let idx = index(&[(10, 0), (20, 100), (30, 200)]);
    let offsets = idx.offsets_in_one_group(&[12, 22, 32]);
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
}

/// Every offset returned must be at or before the first record whose key
/// is >= the query.
#[test]
fn lower_bound_is_safe_for_random_queries() {
    let mut rng = rand::rng();
    for _ in 0..50 {
        let mut keys: Vec<u64> = (0..200).map(|_| rng.random_range(0..10_000)).collect();
        keys.sort_unstable();
        keys.dedup();
        let records: Vec<(u64, u64)> = keys
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i as u64 * 16))
            .collect();
        let step = rng.random_range(1..20);
        let samples: Vec<(u64, u64)> = records.iter().step_by(step).copied().collect();
        let idx = index(&samples);

        for _ in 0..100 {
            let q = rng.random_range(0..10_500);
            let offset = idx.lower_bound(&q);
            let true_offset = records
                .iter()
                .find(|(k, _)| *k >= q)
                .map(|(_, o)| *o)
                .unwrap_or(u64::MAX);
            assert!(offset <= true_offset, "q={q} offset={offset} true={true_offset}");
        }
    }
}
