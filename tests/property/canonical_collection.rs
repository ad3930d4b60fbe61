//! Property-based tests for the canonical collection.
//!
//! Uses proptest to verify, for any sequence of task upserts:
//! 1. Ids stay unique.
//! 2. Records stay sorted newest first.
//! 3. Re-applying the same sequence changes nothing.
//! 4. The last write for an id wins.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use opsync::sync::Collection;
use opsync_proto::Task;
use proptest::prelude::*;

/// Ids drawn from a small pool so that replacements actually happen.
fn arb_task() -> impl Strategy<Value = Task> {
    (
        0u8..8,
        "[a-z ]{0,16}",
        any::<bool>(),
        1_600_000_000_000i64..1_900_000_000_000,
    )
        .prop_map(|(id, text, completed, ms)| {
            let at = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default();
            let mut task = Task::new(text, "", "all", None, at);
            task.id = format!("t{id}");
            if completed {
                task.set_completed(true, None, at);
            }
            task
        })
}

proptest! {
    #[test]
    fn ids_are_unique(tasks in proptest::collection::vec(arb_task(), 0..40)) {
        let collection = Collection::from_records(tasks);
        let mut seen = HashSet::new();
        for task in collection.as_slice() {
            prop_assert!(seen.insert(task.id.clone()), "duplicate id {}", task.id);
        }
    }

    #[test]
    fn order_is_newest_first(tasks in proptest::collection::vec(arb_task(), 0..40)) {
        let collection = Collection::from_records(tasks);
        for pair in collection.as_slice().windows(2) {
            prop_assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn reapplying_is_idempotent(tasks in proptest::collection::vec(arb_task(), 0..40)) {
        let mut collection = Collection::from_records(tasks.clone());
        let before = collection.signature();
        let snapshot = collection.as_slice().to_vec();
        for task in collection.as_slice().to_vec() {
            collection.upsert(task);
        }
        prop_assert_eq!(collection.signature(), before);
        prop_assert_eq!(collection.as_slice(), snapshot.as_slice());
    }

    #[test]
    fn last_write_wins(tasks in proptest::collection::vec(arb_task(), 1..40)) {
        let collection = Collection::from_records(tasks.clone());
        let mut latest = HashMap::new();
        for task in &tasks {
            latest.insert(task.id.clone(), task.clone());
        }
        prop_assert_eq!(collection.len(), latest.len());
        for (id, task) in &latest {
            prop_assert_eq!(collection.get(id), Some(task));
        }
    }
}
