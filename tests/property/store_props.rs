//! Property-based tests for the trace store
//!
//! Every case opens a fresh database in a temp directory, so case counts are
//! kept low.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tempfile::tempdir;

use mqtt_tracer::message::TraceMessage;
use mqtt_tracer::store::TraceStore;

/// Strategy for concrete topics the store keys on
fn topic_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,4}(/[a-z0-9]{1,4}){0,2}"
}

/// Strategy for trace keys; no `/` by construction
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,8}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// A stored record is returned by `messages` and gone after `delete`.
    #[test]
    fn prop_add_then_delete(
        key in key_strategy(),
        topic in topic_strategy(),
        payload in "[ -~]{0,32}",
        secs in 0i64..4_000_000_000,
        nanos in 0u32..1_000_000_000,
    ) {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let msg = TraceMessage::trace(
            Utc.timestamp_opt(secs, nanos).unwrap(),
            &topic,
            payload.as_bytes(),
        );

        store.add("p", &key, &msg).unwrap();
        prop_assert!(store.messages("p", &key).unwrap().contains(&msg));
        prop_assert!(store.has_data("p", &key).unwrap());

        store.delete("p", &key).unwrap();
        prop_assert!(!store.has_data("p", &key).unwrap());
        prop_assert!(store.messages("p", &key).unwrap().is_empty());
    }

    /// Records of one topic come back in timestamp order whatever order they
    /// were written in.
    #[test]
    fn prop_messages_are_chronological_per_topic(
        topic in topic_strategy(),
        offsets in prop::collection::btree_set(0u64..10_000_000_000, 1..12)
            .prop_map(|set| set.into_iter().collect::<Vec<_>>())
            .prop_shuffle(),
    ) {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let base = 1_700_000_000_000_000_000i64;

        for offset in &offsets {
            let ts = Utc.timestamp_nanos(base + *offset as i64);
            let msg = TraceMessage::trace(ts, &topic, offset.to_string().as_bytes());
            store.add("p", "k", &msg).unwrap();
        }

        let stored: Vec<String> = store
            .messages("p", "k")
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        let expected: Vec<String> = sorted.iter().map(|o| o.to_string()).collect();
        prop_assert_eq!(stored, expected);
    }
}
