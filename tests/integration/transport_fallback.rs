//! Integration tests for degraded connectivity.
//!
//! With the push feed down, the pull fallback must still converge and must
//! only notify when the fetched rows actually changed. With the remote down
//! entirely, local writes still land and are not retried later.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use opsync::client::{ClientOptions, SyncClient};
use opsync::identity::Identity;
use opsync::peer::bus::{BusPeer, PeerBus};
use opsync::remote::memory::MemoryRemote;
use opsync::remote::RemoteStore;
use opsync::store::DurableStore;
use opsync::sync::SyncEvent;
use opsync_proto::remote::Table;
use opsync_proto::{MessageKind, Task, stamp};

type Client = SyncClient<MemoryRemote, BusPeer>;

const POLL: Duration = Duration::from_millis(50);

fn make_client(remote: Option<Arc<MemoryRemote>>, peer: Option<Arc<BusPeer>>) -> Client {
    let options = ClientOptions {
        poll_interval: POLL,
        remote_timeout: Duration::from_millis(500),
        ..ClientOptions::default()
    };
    SyncClient::new(
        Identity::new("user-1", "Desk", "reception"),
        Arc::new(DurableStore::in_memory().unwrap()),
        options,
        remote,
        peer,
    )
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

fn task_row(id: &str, text: &str) -> serde_json::Value {
    json!({
        "id": id,
        "text": text,
        "assigned_to": "",
        "target_role": "all",
        "completed": false,
        "created_at": stamp::format(&Utc::now())
    })
}

#[tokio::test]
async fn poll_picks_up_changes_while_feed_is_down() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_feed(false);
    let client = make_client(Some(Arc::clone(&remote)), None);
    client.start().await;

    remote.seed(Table::Tasks, task_row("t1", "via poll"));
    assert!(wait_until(|| client.tasks().len() == 1).await);

    remote
        .update(Table::Tasks, "t1", json!({ "completed": true, "completed_at": stamp::format(&Utc::now()) }))
        .await
        .unwrap();
    assert!(wait_until(|| client.tasks()[0].completed).await);

    remote.delete(Table::Tasks, "t1").await.unwrap();
    // Polling cannot observe deletes; the row stays until a push or restart.
    tokio::time::sleep(POLL * 4).await;
    assert_eq!(client.tasks().len(), 1);
}

#[tokio::test]
async fn poll_notifies_only_on_signature_change() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_feed(false);
    let client = make_client(Some(Arc::clone(&remote)), None);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = client.subscribe_tasks(move |e: &SyncEvent<Task>| sink.lock().push(e.clone()));
    client.start().await;

    tokio::time::sleep(POLL * 4).await;
    assert!(events.lock().is_empty(), "idle polls emit nothing");

    remote.seed(Table::Tasks, task_row("t1", "x"));
    assert!(wait_until(|| !events.lock().is_empty()).await);
    tokio::time::sleep(POLL * 4).await;
    assert_eq!(*events.lock(), vec![SyncEvent::Sync]);
}

#[tokio::test]
async fn poll_stays_quiet_while_feed_is_live() {
    let remote = Arc::new(MemoryRemote::new());
    let client = make_client(Some(Arc::clone(&remote)), None);
    client.start().await;
    let after_start = remote.calls();

    tokio::time::sleep(POLL * 4).await;
    assert_eq!(remote.calls(), after_start);
}

#[tokio::test]
async fn failed_writes_are_not_retried() {
    let remote = Arc::new(MemoryRemote::new());
    let client = make_client(Some(Arc::clone(&remote)), None);
    client.start().await;

    remote.set_online(false);
    let task = client.add_task("offline edit", "", "all", None).unwrap();
    let me = client.identity().clone();
    client
        .send_message("offline note", &me, None, MessageKind::Text)
        .unwrap();
    assert!(client.settle(Duration::from_secs(2)).await);

    remote.set_online(true);
    tokio::time::sleep(POLL * 4).await;

    assert!(remote.rows(Table::Tasks).is_empty());
    assert!(remote.rows(Table::Messages).is_empty());
    // the optimistic copies stand
    assert_eq!(client.tasks()[0].id, task.id);
    assert!(client.messages()[0].is_local());
}

#[tokio::test]
async fn lan_only_peers_still_converge() {
    let bus = PeerBus::new();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);
    let a = make_client(Some(Arc::clone(&remote)), Some(Arc::new(bus.join())));
    let b = make_client(Some(Arc::clone(&remote)), Some(Arc::new(bus.join())));
    a.start().await;
    b.start().await;

    a.add_task("lan only", "", "all", None).unwrap();
    assert!(wait_until(|| b.tasks().len() == 1).await);
    let me = b.identity().clone();
    b.send_message("seen", &me, None, MessageKind::Text).unwrap();
    assert!(wait_until(|| a.messages().len() == 1).await);
}

#[tokio::test]
async fn no_transports_is_fine() {
    let client = make_client(None, None);
    client.start().await;
    client.add_task("solo", "", "all", None).unwrap();
    assert!(client.settle(Duration::from_millis(100)).await);
    assert_eq!(client.tasks().len(), 1);
    client.shutdown();
}
