//! Integration tests for optimistic message sends.
//!
//! A sent message shows up at once under a `local-` id. The remote echo
//! carries a different, server-assigned id and must replace the optimistic
//! copy rather than sit next to it.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::json;

use opsync::client::{ClientOptions, SyncClient};
use opsync::identity::Identity;
use opsync::peer::bus::{BusPeer, PeerBus};
use opsync::remote::memory::MemoryRemote;
use opsync::store::{DurableStore, RecordKind};
use opsync::sync::SyncEvent;
use opsync_proto::remote::Table;
use opsync_proto::{Message, MessageKind, stamp};

type Client = SyncClient<MemoryRemote, BusPeer>;

const DESK_ID: &str = "0190d1b2-7c4e-7a11-9f00-1234567890ab";

fn make_client(
    identity: Identity,
    remote: Option<Arc<MemoryRemote>>,
    peer: Option<Arc<BusPeer>>,
) -> Client {
    SyncClient::new(
        identity,
        Arc::new(DurableStore::in_memory().unwrap()),
        ClientOptions::default(),
        remote,
        peer,
    )
}

fn desk() -> Identity {
    Identity::new(DESK_ID, "Front Desk", "reception")
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn message_row(sender_id: Option<&str>, content: &str, at: chrono::DateTime<Utc>) -> serde_json::Value {
    json!({
        "content": content,
        "sender_id": sender_id,
        "sender_name": "Someone",
        "sender_role": "printer",
        "recipient_id": null,
        "message_type": "text",
        "created_at": stamp::format(&at),
        "is_read": false
    })
}

#[tokio::test]
async fn echo_replaces_optimistic_copy() {
    let remote = Arc::new(MemoryRemote::new());
    let client = make_client(desk(), Some(Arc::clone(&remote)), None);
    client.start().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = client.subscribe_messages(move |e: &SyncEvent<Message>| sink.lock().push(e.clone()));

    let me = client.identity().clone();
    let sent = client
        .send_message("albums are ready", &me, None, MessageKind::Text)
        .unwrap();
    assert!(sent.is_local());
    assert!(client.settle(Duration::from_secs(2)).await);
    assert!(wait_until(|| client.messages().iter().all(|m| !m.is_local())).await);

    let messages = client.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "albums are ready");
    assert_eq!(messages[0].sender_id.as_deref(), Some(DESK_ID));

    let events = events.lock();
    assert!(events.contains(&SyncEvent::Delete(sent.id.clone())));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SyncEvent::Delete(_)))
            .count(),
        1,
        "optimistic copy is withdrawn exactly once"
    );
}

#[tokio::test]
async fn replaced_optimistic_id_leaves_the_store() {
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(DurableStore::in_memory().unwrap());
    let client: Client = SyncClient::new(
        desk(),
        Arc::clone(&store),
        ClientOptions::default(),
        Some(remote),
        None,
    );
    let me = client.identity().clone();
    client
        .send_message("ping", &me, None, MessageKind::Text)
        .unwrap();
    assert!(client.settle(Duration::from_secs(2)).await);

    let stored = store.read_all(RecordKind::Messages).unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0]["id"].as_str().unwrap().starts_with("local-"));
}

#[tokio::test]
async fn peer_copy_is_reconciled_by_remote_echo() {
    let bus = PeerBus::new();
    let remote = Arc::new(MemoryRemote::new());
    let a = make_client(desk(), Some(Arc::clone(&remote)), Some(Arc::new(bus.join())));
    let b = make_client(
        Identity::new("printer-1", "Printer", "printer"),
        Some(Arc::clone(&remote)),
        Some(Arc::new(bus.join())),
    );
    a.start().await;
    b.start().await;

    let me = a.identity().clone();
    a.send_message("paper jam fixed?", &me, None, MessageKind::Text)
        .unwrap();
    assert!(a.settle(Duration::from_secs(2)).await);

    assert!(wait_until(|| {
        let seen = b.messages();
        seen.len() == 1 && !seen[0].is_local()
    })
    .await);
    assert_eq!(b.messages().len(), 1);
    assert_eq!(a.messages().len(), 1);
    assert_eq!(a.messages()[0].id, b.messages()[0].id);
}

#[tokio::test]
async fn unrelated_message_is_not_merged() {
    let remote = Arc::new(MemoryRemote::new());
    let client = make_client(
        Identity::new("user-1", "Desk", "reception"),
        Some(Arc::clone(&remote)),
        None,
    );
    client.start().await;

    // The send fails, so the optimistic copy stays unconfirmed.
    remote.set_online(false);
    let me = client.identity().clone();
    let sent = client.send_message("ok", &me, None, MessageKind::Text).unwrap();
    assert!(client.settle(Duration::from_secs(2)).await);
    remote.set_online(true);

    // Same content, but from a different (UUID) sender.
    remote.seed(Table::Messages, message_row(Some(DESK_ID), "ok", Utc::now()));
    assert!(wait_until(|| client.messages().len() == 2).await);
    assert!(client.messages().iter().any(|m| m.id == sent.id));

    // The real echo: sender nulled at the remote, same content, same time.
    remote.seed(Table::Messages, message_row(None, "ok", sent.created_at));
    assert!(wait_until(|| client.messages().iter().all(|m| !m.is_local())).await);
    assert_eq!(client.messages().len(), 2);
}

#[tokio::test]
async fn echo_outside_window_is_a_new_message() {
    let remote = Arc::new(MemoryRemote::new());
    let client = make_client(desk(), Some(Arc::clone(&remote)), None);
    client.start().await;

    remote.set_online(false);
    let me = client.identity().clone();
    let sent = client.send_message("late", &me, None, MessageKind::Text).unwrap();
    assert!(client.settle(Duration::from_secs(2)).await);
    remote.set_online(true);

    remote.seed(
        Table::Messages,
        message_row(Some(DESK_ID), "late", sent.created_at + TimeDelta::seconds(30)),
    );
    assert!(wait_until(|| client.messages().len() == 2).await);
    assert!(client.messages().iter().any(|m| m.is_local()));
}

#[tokio::test]
async fn direct_and_group_messages_do_not_match() {
    let remote = Arc::new(MemoryRemote::new());
    let client = make_client(desk(), Some(Arc::clone(&remote)), None);
    client.start().await;

    remote.set_online(false);
    let me = client.identity().clone();
    let sent = client
        .send_message("see me", &me, Some("printer-1"), MessageKind::Text)
        .unwrap();
    assert!(client.settle(Duration::from_secs(2)).await);
    remote.set_online(true);

    // A group message with identical sender and content.
    remote.seed(Table::Messages, message_row(Some(DESK_ID), "see me", sent.created_at));
    assert!(wait_until(|| client.messages().len() == 2).await);
}
