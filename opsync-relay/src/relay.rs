//! Relay server core: shared state, WebSocket handler, request execution,
//! and change fan-out.
//!
//! Every connection may send [`Request`] frames at any time and receives
//! one [`ServerFrame::Reply`] per request, in order. A connection that
//! subscribed to a table also receives a [`ServerFrame::Change`] for every
//! write to it, its own writes included.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use opsync_proto::codec;
use opsync_proto::remote::{ChangeKind, Op, Reply, Request, ServerFrame, Table};
use opsync_proto::stamp;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

use crate::store::TableStore;

/// Default maximum accepted request frame size (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Default cap on rows returned by one fetch.
pub const DEFAULT_MAX_FETCH_ROWS: usize = 1000;

/// Per-request limits enforced by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest request frame accepted, in bytes.
    pub max_frame_size: usize,
    /// Most rows a single `FetchSince` returns, whatever the client asks.
    pub max_fetch_rows: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_fetch_rows: DEFAULT_MAX_FETCH_ROWS,
        }
    }
}

/// One live WebSocket connection.
struct Connection {
    sender: mpsc::UnboundedSender<Message>,
    subscribed: BTreeSet<Table>,
}

/// Shared relay state: the connection registry and the tables.
pub struct RelayState {
    connections: RwLock<HashMap<u64, Connection>>,
    next_connection: AtomicU64,
    /// Rows held by the relay.
    pub store: TableStore,
    limits: Limits,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates empty state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(Limits::default(), TableStore::new())
    }

    /// Creates state with custom limits over an existing store.
    #[must_use]
    pub fn with_limits(limits: Limits, store: TableStore) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            store,
            limits,
        }
    }

    /// Registers a connection and returns its id.
    pub async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(
            id,
            Connection {
                sender,
                subscribed: BTreeSet::new(),
            },
        );
        id
    }

    /// Removes a connection, returning whether it was registered.
    pub async fn unregister(&self, connection: u64) -> bool {
        self.connections.write().await.remove(&connection).is_some()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Adds `table` to the connection's subscriptions.
    pub async fn subscribe(&self, connection: u64, table: Table) {
        if let Some(conn) = self.connections.write().await.get_mut(&connection) {
            conn.subscribed.insert(table);
        }
    }

    /// Send a WebSocket Close frame to all connected clients.
    ///
    /// Each client's reader sees the close and drops its link. Useful for
    /// graceful shutdown and for exercising client reconnects in tests.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, conn) in conns.iter() {
            tracing::info!(connection = id, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    async fn send_to(&self, connection: u64, frame: &ServerFrame) {
        let bytes = match codec::encode(frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode server frame");
                return;
            }
        };
        if let Some(conn) = self.connections.read().await.get(&connection) {
            let _ = conn.sender.send(Message::Binary(bytes.into()));
        }
    }

    async fn fan_out(&self, table: Table, frame: &ServerFrame) {
        let bytes = match codec::encode(frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode change frame");
                return;
            }
        };
        let conns = self.connections.read().await;
        let mut delivered = 0usize;
        for conn in conns.values().filter(|c| c.subscribed.contains(&table)) {
            if conn.sender.send(Message::Binary(bytes.clone().into())).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(%table, delivered, "change fanned out");
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Register the connection.
/// 2. Spawn a writer task fed by an unbounded channel.
/// 3. Execute each request frame and reply on the channel.
/// 4. On disconnect, unregister.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(tx).await;
    tracing::info!(connection, "client connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(connection, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(connection).await;
    tracing::info!(connection, "client disconnected");
}

/// Decodes and executes one request frame, replying to the sender.
async fn handle_binary_message(connection: u64, data: &[u8], state: &Arc<RelayState>) {
    let request: Request = match codec::decode(data) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(connection, error = %e, "failed to decode request");
            return;
        }
    };

    let max_frame_size = state.limits.max_frame_size;
    if data.len() > max_frame_size {
        tracing::warn!(
            connection,
            size = data.len(),
            max = max_frame_size,
            "request exceeds frame size limit"
        );
        let reply = Reply::Failed {
            reason: format!(
                "frame too large: {} bytes (max {})",
                data.len(),
                max_frame_size
            ),
        };
        let frame = ServerFrame::Reply {
            request_id: request.request_id,
            reply,
        };
        state.send_to(connection, &frame).await;
        return;
    }

    let table = request.op.table();
    let (reply, change) = execute(connection, request.op, state).await;
    tracing::debug!(connection, request_id = request.request_id, %table, ?reply, "request handled");
    state
        .send_to(
            connection,
            &ServerFrame::Reply {
                request_id: request.request_id,
                reply,
            },
        )
        .await;
    if let Some(change) = change {
        state.fan_out(table, &change).await;
    }
}

/// Runs one operation against the store.
///
/// Returns the reply for the caller and, for writes, the change to fan out.
async fn execute(
    connection: u64,
    op: Op,
    state: &Arc<RelayState>,
) -> (Reply, Option<ServerFrame>) {
    match op {
        Op::Insert { table, row } => {
            let row = match parse_object(&row) {
                Ok(row) => row,
                Err(reply) => return (reply, None),
            };
            match state.store.insert(table, row).await {
                Ok(stored) => written(table, ChangeKind::Insert, &stored),
                Err(e) => (failed(e), None),
            }
        }
        Op::Update { table, id, patch } => {
            let patch = match parse_object(&patch) {
                Ok(patch) => patch,
                Err(reply) => return (reply, None),
            };
            match state.store.update(table, &id, patch).await {
                Ok(stored) => written(table, ChangeKind::Update, &stored),
                Err(e) => (failed(e), None),
            }
        }
        Op::Delete { table, id } => {
            let change = state.store.delete(table, &id).await.then(|| ServerFrame::Change {
                table,
                kind: ChangeKind::Delete,
                id,
                row: None,
            });
            (Reply::Done, change)
        }
        Op::FetchSince {
            table,
            since,
            limit,
        } => {
            let since = match since.as_deref().map(stamp::parse) {
                None => None,
                Some(Some(since)) => Some(since),
                Some(None) => return (failed("unparsable since timestamp"), None),
            };
            let limit = usize::try_from(limit)
                .unwrap_or(usize::MAX)
                .min(state.limits.max_fetch_rows);
            let rows = state
                .store
                .fetch_since(table, since, limit)
                .await
                .iter()
                .map(Value::to_string)
                .collect();
            (Reply::Rows(rows), None)
        }
        Op::Subscribe { table } => {
            state.subscribe(connection, table).await;
            tracing::info!(connection, %table, "subscribed");
            (Reply::Done, None)
        }
    }
}

fn parse_object(raw: &str) -> Result<Value, Reply> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(failed("row must be a JSON object")),
        Err(e) => Err(failed(format!("invalid JSON: {e}"))),
    }
}

fn written(table: Table, kind: ChangeKind, stored: &Value) -> (Reply, Option<ServerFrame>) {
    let row = stored.to_string();
    let id = stored
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let change = ServerFrame::Change {
        table,
        kind,
        id,
        row: Some(row.clone()),
    };
    (Reply::Row(row), Some(change))
}

fn failed(reason: impl ToString) -> Reply {
    Reply::Failed {
        reason: reason.to_string(),
    }
}

/// Starts the relay server on the given address.
///
/// Returns the actual bound address (useful when binding to port 0) and a
/// join handle for the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with pre-configured state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
