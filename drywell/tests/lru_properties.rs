use chrono::{TimeZone, Utc};
use drywell::{CacheEntry, CacheKey, EntryStore, LruEntryStore, SourceFreshness};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8),
    Touch(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12).prop_map(Op::Insert),
        (0u8..12).prop_map(Op::Touch),
    ]
}

fn key(id: u8) -> CacheKey {
    CacheKey::new(format!("key-{}", id)).unwrap()
}

proptest! {
    #[test]
    fn prop_size_never_exceeds_capacity(capacity in 1usize..6, ops in prop::collection::vec(op(), 1..80)) {
        let store = LruEntryStore::new(capacity);
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        // Reference model: last access time per key.
        let mut model: HashMap<u8, i64> = HashMap::new();

        for (step, op) in ops.iter().enumerate() {
            let now = start + chrono::Duration::seconds(step as i64);
            match op {
                Op::Insert(id) => {
                    let entry = CacheEntry::new(
                        Arc::new(*id),
                        now,
                        Duration::from_secs(3600),
                        SourceFreshness::hours(1.0),
                        None,
                    );
                    let outcome = store.insert(key(*id), entry);

                    let expected_victim = if !model.contains_key(id) && model.len() >= capacity {
                        model.iter().min_by_key(|(_, at)| **at).map(|(victim, _)| *victim)
                    } else {
                        None
                    };
                    let evicted: Vec<CacheKey> = outcome.evicted.into_iter().map(|(k, _)| k).collect();
                    match expected_victim {
                        Some(victim) => {
                            prop_assert_eq!(evicted, vec![key(victim)]);
                            model.remove(&victim);
                        }
                        None => prop_assert!(evicted.is_empty()),
                    }
                    model.insert(*id, step as i64);
                }
                Op::Touch(id) => {
                    let touched = store.touch(&key(*id), now);
                    prop_assert_eq!(touched.is_some(), model.contains_key(id));
                    if touched.is_some() {
                        model.insert(*id, step as i64);
                    }
                }
            }
            prop_assert!(store.len() <= capacity);
            prop_assert_eq!(store.len(), model.len());
        }
    }
}
