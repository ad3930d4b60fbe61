//! Integration tests for the WebSocket remote adapter against a real relay.
//!
//! Starts `opsync-relay` on an ephemeral port and drives two clients
//! through it: push propagation, message confirmation, reconnect after the
//! relay drops every connection, and an unreachable relay.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use opsync::client::{ClientOptions, SyncClient};
use opsync::identity::Identity;
use opsync::peer::bus::BusPeer;
use opsync::remote::ws::WsRemote;
use opsync::remote::{RemoteError, RemoteStore};
use opsync::store::DurableStore;
use opsync_proto::MessageKind;
use opsync_proto::remote::Table;
use opsync_relay::relay::{self, RelayState};

type Client = SyncClient<WsRemote, BusPeer>;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

fn remote(addr: SocketAddr) -> Arc<WsRemote> {
    Arc::new(WsRemote::new(&format!("ws://{addr}/ws"), TIMEOUT).unwrap())
}

fn make_client(identity: Identity, remote: Arc<WsRemote>) -> Client {
    let options = ClientOptions {
        remote_timeout: TIMEOUT,
        poll_interval: Duration::from_millis(100),
        ..ClientOptions::default()
    };
    SyncClient::new(
        identity,
        Arc::new(DurableStore::in_memory().unwrap()),
        options,
        Some(remote),
        None,
    )
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn tasks_round_trip_through_relay() {
    let (addr, state) = start_relay().await;
    let a = make_client(Identity::new("a", "Desk", "reception"), remote(addr));
    let b = make_client(Identity::new("b", "Printer", "printer"), remote(addr));
    a.start().await;
    b.start().await;

    let task = a.add_task("print 10 albums", "", "printer", None).unwrap();
    assert!(wait_until(|| b.tasks_for_role("printer").len() == 1).await);
    assert_eq!(state.store.len(Table::Tasks).await, 1);

    b.toggle_task(&task.id, true, None).unwrap();
    assert!(wait_until(|| a.tasks().first().is_some_and(|t| t.completed)).await);

    a.delete_task(&task.id);
    assert!(wait_until(|| b.tasks().is_empty()).await);
    assert!(a.settle(TIMEOUT).await);
    assert!(b.settle(TIMEOUT).await);
    assert_eq!(state.store.len(Table::Tasks).await, 0);
}

#[tokio::test]
async fn message_is_confirmed_once_on_both_sides() {
    let (addr, _state) = start_relay().await;
    let a = make_client(Identity::new("a", "Desk", "reception"), remote(addr));
    let b = make_client(Identity::new("b", "Printer", "printer"), remote(addr));
    a.start().await;
    b.start().await;

    let me = a.identity().clone();
    a.send_message("albums ready", &me, None, MessageKind::Text)
        .unwrap();
    assert!(a.settle(TIMEOUT).await);

    assert!(wait_until(|| b.messages().len() == 1).await);
    assert!(wait_until(|| a.messages().iter().all(|m| !m.is_local())).await);
    assert_eq!(a.messages().len(), 1);
    assert_eq!(a.messages()[0].id, b.messages()[0].id);
}

#[tokio::test]
async fn link_recovers_after_relay_drops_connections() {
    let (addr, state) = start_relay().await;
    let ws = remote(addr);
    let a = make_client(Identity::new("a", "Desk", "reception"), remote(addr));
    let b = make_client(Identity::new("b", "Printer", "printer"), Arc::clone(&ws));
    a.start().await;
    b.start().await;
    assert!(ws.is_connected());

    state.close_all_connections().await;
    assert!(wait_until(|| !ws.is_connected()).await);

    // The poller reconnects b (and re-subscribes); a reconnects on write.
    a.add_task("after reconnect", "", "all", None).unwrap();
    assert!(wait_until(|| b.tasks().len() == 1).await);
    assert!(wait_until(|| ws.is_connected()).await);
}

#[tokio::test]
async fn unreachable_relay_keeps_local_copy() {
    // Bind then drop a listener to get a port with nothing behind it.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let ws = remote(addr);
    let err = ws.fetch_since(Table::Tasks, None, 10).await;
    assert!(matches!(
        err,
        Err(RemoteError::Unreachable(_) | RemoteError::Timeout)
    ));

    let client = make_client(Identity::default(), ws);
    client.start().await;
    client.add_task("offline", "", "all", None).unwrap();
    assert!(client.settle(Duration::from_secs(5)).await);
    assert_eq!(client.tasks().len(), 1);
}

#[test]
fn non_websocket_url_is_rejected() {
    assert!(matches!(
        WsRemote::new("http://example.com/ws", TIMEOUT),
        Err(RemoteError::InvalidUrl(_))
    ));
    assert!(matches!(
        WsRemote::new("not a url", TIMEOUT),
        Err(RemoteError::InvalidUrl(_))
    ));
}
