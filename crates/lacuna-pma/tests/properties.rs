//! Property tests: arbitrary operation sequences checked against a
//! `BTreeMap` reference model, with a full invariant sweep after every
//! phase.

use lacuna_pma::{IndexConfig, PackedMemoryArray};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, i64),
    Remove(i64),
    Get(i64),
    Range(i64, i64),
    Sum(i64, i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (-500i64..500, any::<i64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => (-500i64..500).prop_map(Op::Remove),
        2 => (-600i64..600).prop_map(Op::Get),
        1 => (-600i64..600, -600i64..600).prop_map(|(a, b)| Op::Range(a, b)),
        1 => (-600i64..600, -600i64..600).prop_map(|(a, b)| Op::Sum(a, b)),
    ]
}

fn small_pma() -> PackedMemoryArray {
    PackedMemoryArray::new(IndexConfig {
        segment_capacity: 32,
        index_node_capacity: 4,
        ..Default::default()
    })
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matches_btreemap(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let mut pma = small_pma();
        let mut model: BTreeMap<i64, i64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    // keys are unique: duplicate inserts are unspecified
                    if !model.contains_key(&k) {
                        pma.insert(k, v).unwrap();
                        model.insert(k, v);
                    }
                }
                Op::Remove(k) => {
                    prop_assert_eq!(pma.remove(k), model.remove(&k));
                }
                Op::Get(k) => {
                    prop_assert_eq!(pma.get(k), model.get(&k).copied());
                }
                Op::Range(a, b) => {
                    let got: Vec<_> = pma.range(a, b).collect();
                    let expected: Vec<_> = if a <= b {
                        model.range(a..=b).map(|(&k, &v)| (k, v)).collect()
                    } else {
                        Vec::new()
                    };
                    prop_assert_eq!(got, expected);
                }
                Op::Sum(a, b) => {
                    let got = pma.sum(a, b);
                    let in_range: Vec<_> = if a <= b {
                        model.range(a..=b).map(|(&k, &v)| (k, v)).collect()
                    } else {
                        Vec::new()
                    };
                    prop_assert_eq!(got.num_elements as usize, in_range.len());
                    prop_assert_eq!(got.sum_keys, in_range.iter().map(|&(k, _)| k).sum::<i64>());
                    prop_assert_eq!(got.sum_values, in_range.iter().map(|&(_, v)| v).sum::<i64>());
                    if let (Some(first), Some(last)) = (in_range.first(), in_range.last()) {
                        prop_assert_eq!(got.first_key, first.0);
                        prop_assert_eq!(got.last_key, last.0);
                    }
                }
            }
            prop_assert_eq!(pma.len(), model.len());
        }

        pma.validate().unwrap();
        let collected: Vec<_> = pma.iter().collect();
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(collected, expected);
    }

    #[test]
    fn prop_bulk_load_equals_point_inserts(
        mut existing in prop::collection::btree_set(-2000i64..2000, 0..300),
        batch_keys in prop::collection::btree_set(-2000i64..2000, 1..300),
    ) {
        // the batch must contain only new keys
        for k in &batch_keys {
            existing.remove(k);
        }

        let mut bulk = small_pma();
        let mut point = small_pma();
        for &k in &existing {
            bulk.insert(k, k * 2).unwrap();
            point.insert(k, k * 2).unwrap();
        }

        let batch: Vec<(i64, i64)> = batch_keys.iter().map(|&k| (k, -k)).collect();
        bulk.load_sorted(&batch).unwrap();
        for &(k, v) in &batch {
            point.insert(k, v).unwrap();
        }

        bulk.validate().unwrap();
        point.validate().unwrap();
        prop_assert_eq!(bulk.len(), existing.len() + batch.len());
        let bulk_elements: Vec<_> = bulk.iter().collect();
        let point_elements: Vec<_> = point.iter().collect();
        prop_assert_eq!(bulk_elements, point_elements);
    }

    #[test]
    fn prop_insert_remove_all_leaves_empty(keys in prop::collection::btree_set(-10_000i64..10_000, 1..500)) {
        let mut pma = small_pma();
        for &k in &keys {
            pma.insert(k, k).unwrap();
        }
        pma.validate().unwrap();
        prop_assert_eq!(pma.len(), keys.len());

        for &k in &keys {
            prop_assert_eq!(pma.remove(k), Some(k));
        }
        prop_assert!(pma.is_empty());
        pma.validate().unwrap();
        prop_assert_eq!(pma.iter().count(), 0);

        // the emptied structure accepts new content
        pma.insert(7, 70).unwrap();
        prop_assert_eq!(pma.get(7), Some(70));
        pma.validate().unwrap();
    }
}
