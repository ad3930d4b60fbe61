//! Integration tests for the shared task list.
//!
//! Covers the end-to-end task lifecycle against an on-disk store,
//! retention, idempotence, and propagation between clients over the peer
//! bus and over a shared remote.

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
use opsync::sync::{Applied, Origin, SyncEvent};
use opsync_proto::Task;

type Client = SyncClient<MemoryRemote, BusPeer>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_client(
    store: Arc<DurableStore>,
    remote: Option<Arc<MemoryRemote>>,
    peer: Option<Arc<BusPeer>>,
) -> Client {
    SyncClient::new(
        Identity::new("user-1", "Front Desk", "reception"),
        store,
        ClientOptions::default(),
        remote,
        peer,
    )
}

fn memory_store() -> Arc<DurableStore> {
    Arc::new(DurableStore::in_memory().unwrap())
}

/// Polls `check` until it holds or two seconds pass.
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

fn stored_ids(store: &DurableStore) -> Vec<String> {
    store
        .read_all(RecordKind::Tasks)
        .unwrap()
        .iter()
        .filter_map(|v| v["id"].as_str().map(str::to_string))
        .collect()
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn add_toggle_delete_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DurableStore::open(dir.path(), true).unwrap());
    let client = make_client(Arc::clone(&store), None, None);

    let task = client
        .add_task("print 10 albums", "الطباعة", "printer", Some("user-1"))
        .unwrap();
    let tasks = client.tasks();
    assert_eq!(tasks.len(), 1);
    assert!(!tasks[0].completed);
    assert_eq!(tasks[0].assignee_label, "الطباعة");

    let done = client.toggle_task(&task.id, true, Some("user-1")).unwrap();
    assert!(done.completed);
    assert_eq!(done.completed_by.as_deref(), Some("user-1"));
    assert!(done.completed_at.is_some());
    assert_eq!(client.tasks()[0], done);

    assert!(client.delete_task(&task.id));
    assert!(client.tasks().is_empty());

    drop(client);
    drop(store);
    let reopened = DurableStore::open(dir.path(), true).unwrap();
    assert!(reopened.read_all(RecordKind::Tasks).unwrap().is_empty());
}

#[tokio::test]
async fn tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store = Arc::new(DurableStore::open(dir.path(), true).unwrap());
        let client = make_client(store, None, None);
        client.add_task("restock paper", "", "all", None).unwrap().id
    };

    let store = Arc::new(DurableStore::open(dir.path(), true).unwrap());
    let client = make_client(store, None, None);
    let tasks = client.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
}

// ===========================================================================
// Retention
// ===========================================================================

#[tokio::test]
async fn archived_task_disappears_without_delete_event() {
    let client = make_client(memory_store(), None, None);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = client.subscribe_tasks(move |e: &SyncEvent<Task>| sink.lock().push(e.clone()));

    let old = Task::new("old", "", "all", None, Utc::now() - TimeDelta::days(61));
    let applied = client.task_sync().upsert(old, Origin::Remote);

    assert_eq!(applied, Applied::Archived);
    assert!(client.tasks().is_empty());
    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn stale_completed_task_is_hidden_but_kept() {
    let store = memory_store();
    let now = Utc::now();
    let mut stale = Task::new("boxed", "", "all", None, now - TimeDelta::days(10));
    stale.set_completed(true, Some("user-2".into()), now - TimeDelta::days(8));
    let ancient = Task::new("ancient", "", "all", None, now - TimeDelta::days(61));
    store
        .write_all(
            RecordKind::Tasks,
            &[
                serde_json::to_value(&stale).unwrap(),
                serde_json::to_value(&ancient).unwrap(),
            ],
        )
        .unwrap();

    let client = make_client(Arc::clone(&store), None, None);
    assert!(client.tasks().is_empty());
    let kept: Vec<_> = client
        .task_sync()
        .snapshot()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(kept, vec![stale.id.clone()]);
    // the archived one is pruned from the store on load, the hidden one stays
    assert_eq!(stored_ids(&store), vec![stale.id]);
}

#[tokio::test]
async fn stray_completion_fields_are_cleared_on_load() {
    let store = memory_store();
    let now = Utc::now();
    store
        .write_all(
            RecordKind::Tasks,
            &[json!({
                "id": "t1",
                "text": "fold flyers",
                "completed": false,
                "completedAt": now.to_rfc3339(),
                "completedBy": "user-9",
                "createdAt": now.to_rfc3339()
            })],
        )
        .unwrap();

    let client = make_client(store, None, None);
    let task = &client.tasks()[0];
    assert!(task.completed_at.is_none());
    assert!(task.completed_by.is_none());
}

// ===========================================================================
// Idempotence
// ===========================================================================

#[tokio::test]
async fn same_record_twice_changes_nothing() {
    let store = memory_store();
    let client = make_client(Arc::clone(&store), None, None);
    let task = Task::new("x", "", "all", None, Utc::now());

    assert_eq!(
        client.task_sync().upsert(task.clone(), Origin::Peer),
        Applied::Inserted
    );
    let persisted = store.read_all(RecordKind::Tasks).unwrap();
    assert_eq!(
        client.task_sync().upsert(task, Origin::Remote),
        Applied::Unchanged
    );
    assert_eq!(client.tasks().len(), 1);
    assert_eq!(store.read_all(RecordKind::Tasks).unwrap(), persisted);
}

#[tokio::test]
async fn existing_id_is_replaced_not_appended() {
    let client = make_client(memory_store(), None, None);
    let mut task = Task::new("x", "", "all", None, Utc::now());
    client.task_sync().upsert(task.clone(), Origin::Local);
    task.text = "y".into();
    assert_eq!(
        client.task_sync().upsert(task, Origin::Peer),
        Applied::Replaced
    );
    let tasks = client.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].text, "y");
}

// ===========================================================================
// Propagation
// ===========================================================================

#[tokio::test]
async fn peers_on_one_bus_converge() {
    let bus = PeerBus::new();
    let a = make_client(memory_store(), None, Some(Arc::new(bus.join())));
    let b = make_client(memory_store(), None, Some(Arc::new(bus.join())));
    a.start().await;
    b.start().await;

    let task = a.add_task("print 10 albums", "", "printer", None).unwrap();
    assert!(wait_until(|| b.tasks().len() == 1).await);
    assert_eq!(b.tasks()[0], task);

    let done = a.toggle_task(&task.id, true, Some("user-1")).unwrap();
    assert!(wait_until(|| b.tasks().first() == Some(&done)).await);

    b.update_task(&task.id, "print 12 albums").unwrap();
    assert!(wait_until(|| a.tasks()[0].text == "print 12 albums").await);

    assert!(a.delete_task(&task.id));
    assert!(wait_until(|| b.tasks().is_empty()).await);
}

#[tokio::test]
async fn remote_push_reaches_other_client() {
    let remote = Arc::new(MemoryRemote::new());
    let a = make_client(memory_store(), Some(Arc::clone(&remote)), None);
    let b = make_client(memory_store(), Some(Arc::clone(&remote)), None);
    a.start().await;
    b.start().await;

    let task = a.add_task("call supplier", "", "all", Some("user-1")).unwrap();
    assert!(wait_until(|| b.tasks().iter().any(|t| t.id == task.id)).await);
    // non-UUID attribution was nulled at the remote boundary
    assert!(b.tasks()[0].created_by.is_none());

    a.toggle_task(&task.id, true, None).unwrap();
    assert!(wait_until(|| b.tasks().first().is_some_and(|t| t.completed)).await);

    a.delete_task(&task.id);
    assert!(wait_until(|| b.tasks().is_empty()).await);
    assert!(a.settle(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn start_fetches_existing_remote_rows() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(
        opsync_proto::remote::Table::Tasks,
        json!({
            "id": "t-remote",
            "text": "seeded",
            "assigned_to": "",
            "target_role": "all",
            "completed": false,
            "created_at": opsync_proto::stamp::format(&Utc::now())
        }),
    );
    let client = make_client(memory_store(), Some(remote), None);
    assert!(client.tasks().is_empty());
    client.start().await;
    assert_eq!(client.tasks()[0].id, "t-remote");
}

// ===========================================================================
// Transport independence
// ===========================================================================

#[tokio::test]
async fn add_task_works_with_remote_down() {
    let store = memory_store();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);
    let client = make_client(Arc::clone(&store), Some(Arc::clone(&remote)), None);
    client.start().await;

    let task = client.add_task("works offline", "", "all", None).unwrap();
    assert!(client.settle(Duration::from_secs(2)).await);

    assert_eq!(client.tasks(), vec![task.clone()]);
    assert_eq!(stored_ids(&store), vec![task.id]);
    assert!(remote.rows(opsync_proto::remote::Table::Tasks).is_empty());
}
