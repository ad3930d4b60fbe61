//! Property-based tests for record parsing and wire encoding.
//!
//! Uses proptest to verify:
//! 1. Any task or message survives canonical JSON → lenient parse unchanged.
//! 2. Arbitrary JSON objects never make the lenient parsers panic.
//! 3. Any request frame survives postcard encode → decode.
//! 4. Random bytes never cause a panic in the wire or datagram decoders.

use chrono::{DateTime, Utc};
use opsync_proto::message::{Message, MessageKind};
use opsync_proto::remote::{Op, Request, ServerFrame, Table};
use opsync_proto::task::Task;
use opsync_proto::{codec, peer};
use proptest::prelude::*;

// --- Strategies ---

/// Millisecond timestamps between 2001 and 2100.
fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_000_000_000_000i64..4_102_444_800_000)
        .prop_map(|ms| DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default())
}

fn arb_id() -> impl Strategy<Value = String> {
    "[a-z0-9-]{1,36}"
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        arb_id(),
        ".{0,200}",
        ".{0,40}",
        prop_oneof![Just("all".to_string()), "[a-z]{1,12}"],
        any::<bool>(),
        arb_timestamp(),
        arb_timestamp(),
        proptest::option::of(arb_id()),
    )
        .prop_map(
            |(id, text, assignee_label, target_role_tag, completed, created_at, done_at, created_by)| {
                let mut task = Task {
                    id,
                    text,
                    assignee_label,
                    target_role_tag,
                    completed: false,
                    completed_at: None,
                    completed_by: None,
                    created_at,
                    created_by,
                };
                if completed {
                    task.set_completed(true, Some("someone".into()), done_at);
                }
                task
            },
        )
}

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Text),
        Just(MessageKind::Image),
        Just(MessageKind::File),
        Just(MessageKind::Audio),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        arb_id(),
        ".{0,200}",
        proptest::option::of(arb_id()),
        ".{0,40}",
        proptest::option::of(arb_id()),
        arb_kind(),
        arb_timestamp(),
        any::<bool>(),
    )
        .prop_map(
            |(id, content, sender_id, sender_name, recipient_id, kind, created_at, is_read)| {
                Message {
                    id,
                    content,
                    sender_id,
                    sender_name,
                    sender_role_tag: "desk".into(),
                    recipient_id,
                    kind,
                    created_at,
                    is_read,
                }
            },
        )
}

fn arb_table() -> impl Strategy<Value = Table> {
    prop_oneof![Just(Table::Tasks), Just(Table::Messages)]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (arb_table(), ".{0,256}").prop_map(|(table, row)| Op::Insert { table, row }),
        (arb_table(), arb_id(), ".{0,256}")
            .prop_map(|(table, id, patch)| Op::Update { table, id, patch }),
        (arb_table(), arb_id()).prop_map(|(table, id)| Op::Delete { table, id }),
        (arb_table(), proptest::option::of(".{0,32}"), any::<u32>())
            .prop_map(|(table, since, limit)| Op::FetchSince { table, since, limit }),
        arb_table().prop_map(|table| Op::Subscribe { table }),
    ]
}

/// Shallow JSON objects with a mix of plausible and wrong-typed fields.
fn arb_loose_json() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        ".{0,24}".prop_map(serde_json::Value::from),
    ];
    let key = prop_oneof![
        Just("id".to_string()),
        Just("text".to_string()),
        Just("content".to_string()),
        Just("completed".to_string()),
        Just("completedAt".to_string()),
        Just("createdAt".to_string()),
        Just("kind".to_string()),
        "[a-zA-Z]{1,10}",
    ];
    proptest::collection::btree_map(key, leaf, 0..8)
        .prop_map(|map| serde_json::Value::Object(map.into_iter().collect()))
}

// --- Property tests ---

proptest! {
    /// A task serialized to canonical JSON parses back unchanged.
    #[test]
    fn task_canonical_json_round_trip(task in arb_task(), now in arb_timestamp()) {
        let value = serde_json::to_value(&task).expect("serialize should succeed");
        prop_assert_eq!(Task::from_json(&value, now), Some(task));
    }

    /// A message serialized to canonical JSON parses back unchanged.
    #[test]
    fn message_canonical_json_round_trip(msg in arb_message(), now in arb_timestamp()) {
        let value = serde_json::to_value(&msg).expect("serialize should succeed");
        prop_assert_eq!(Message::from_json(&value, now), Some(msg));
    }

    /// Loose JSON never panics; anything accepted has a non-empty id and
    /// open tasks never keep completion fields.
    #[test]
    fn loose_json_parses_without_panic(value in arb_loose_json(), now in arb_timestamp()) {
        if let Some(task) = Task::from_json(&value, now) {
            prop_assert!(!task.id.trim().is_empty());
            if !task.completed {
                prop_assert!(task.completed_at.is_none());
                prop_assert!(task.completed_by.is_none());
            }
        }
        if let Some(msg) = Message::from_json(&value, now) {
            prop_assert!(!msg.id.trim().is_empty());
        }
    }

    /// Any request survives a postcard encode → decode round-trip.
    #[test]
    fn request_round_trip(request_id in any::<u64>(), op in arb_op()) {
        let request = Request { request_id, op };
        let bytes = codec::encode(&request).expect("encode should succeed");
        let decoded: Request = codec::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(request, decoded);
    }

    /// Random bytes never cause a panic when decoded as a server frame.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ServerFrame>(&bytes);
        let _ = codec::decode::<Request>(&bytes);
    }

    /// Random bytes never cause a panic when decoded as a peer datagram.
    #[test]
    fn random_bytes_datagram_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = peer::decode(&bytes);
    }
}
