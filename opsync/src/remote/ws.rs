//! WebSocket adapter for `opsync-relay`.
//!
//! Speaks the `opsync-proto` wire protocol: postcard-encoded
//! [`Request`]/[`ServerFrame`] frames, one per binary message. Requests are
//! correlated with replies by id, so any number may be in flight on one
//! link.
//!
//! The link is established lazily by the first call and re-established by
//! the first call after it drops. A fresh link re-issues every table
//! subscription, so the poll fallback doubles as the reconnect trigger.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use opsync_proto::codec;
use opsync_proto::remote::{Op, Reply, Request, ServerFrame, Table};
use opsync_proto::stamp;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{RemoteChange, RemoteError, RemoteStore};

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type Pending = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Default largest frame accepted from the server.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of each table's change channel.
const FEED_CAPACITY: usize = 256;

/// One established WebSocket connection.
struct Link {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Remote store reached over WebSocket.
pub struct WsRemote {
    url: String,
    timeout: Duration,
    max_frame_size: usize,
    link: parking_lot::Mutex<Option<Arc<Link>>>,
    /// Serializes reconnect attempts.
    connecting: tokio::sync::Mutex<()>,
    next_request: AtomicU64,
    feeds: BTreeMap<Table, broadcast::Sender<RemoteChange>>,
    subscribed: parking_lot::Mutex<BTreeSet<Table>>,
}

impl WsRemote {
    /// Creates an adapter for `url` (`ws://` or `wss://`). Does not connect.
    ///
    /// `timeout` bounds every call, connecting included.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidUrl`] if `url` is not a WebSocket URL.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let parsed =
            url::Url::parse(url).map_err(|e| RemoteError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RemoteError::InvalidUrl(format!(
                "{url}: scheme must be ws or wss"
            )));
        }
        let feeds = Table::ALL
            .into_iter()
            .map(|t| (t, broadcast::channel(FEED_CAPACITY).0))
            .collect();
        Ok(Self {
            url: url.to_string(),
            timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            link: parking_lot::Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            next_request: AtomicU64::new(1),
            feeds,
            subscribed: parking_lot::Mutex::new(BTreeSet::new()),
        })
    }

    /// Sets the largest server frame accepted before it is dropped.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.live_link().is_some()
    }

    fn live_link(&self) -> Option<Arc<Link>> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| link.connected.load(Ordering::Relaxed))
            .cloned()
    }

    /// Returns the live link, connecting if there is none.
    async fn ensure_link(&self) -> Result<Arc<Link>, RemoteError> {
        if let Some(link) = self.live_link() {
            return Ok(link);
        }
        let _gate = self.connecting.lock().await;
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        let link = Arc::new(self.open_link().await?);
        *self.link.lock() = Some(Arc::clone(&link));
        tracing::info!(url = %self.url, "remote link established");

        let tables: Vec<Table> = self.subscribed.lock().iter().copied().collect();
        for table in tables {
            if let Err(e) = self.call_on(&link, Op::Subscribe { table }).await {
                tracing::warn!(%table, error = %e, "failed to resubscribe");
            }
        }
        Ok(link)
    }

    async fn open_link(&self) -> Result<Link, RemoteError> {
        let (ws_stream, _response) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.url, "remote connect timed out");
                RemoteError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %self.url, err = %e, "remote connect failed");
                map_ws_connect_error(&self.url, e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(writer_loop(ws_sender, rx, Arc::clone(&connected)));
        let reader = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&pending),
            self.feeds.clone(),
            Arc::clone(&connected),
            self.max_frame_size,
        ));

        Ok(Link {
            outgoing: tx,
            pending,
            connected,
            reader,
            writer,
        })
    }

    /// Sends `op` on `link` and waits for its reply.
    async fn call_on(&self, link: &Link, op: Op) -> Result<Reply, RemoteError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let bytes = codec::encode(&Request { request_id, op })?;
        let (tx, rx) = oneshot::channel();
        link.pending.lock().insert(request_id, tx);
        if link.outgoing.send(bytes).is_err() {
            link.pending.lock().remove(&request_id);
            return Err(RemoteError::ConnectionClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                link.pending.lock().remove(&request_id);
                Err(RemoteError::Timeout)
            }
            Ok(Err(_)) => Err(RemoteError::ConnectionClosed),
            Ok(Ok(Reply::Failed { reason })) => Err(RemoteError::Rejected(reason)),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    async fn call(&self, op: Op) -> Result<Reply, RemoteError> {
        let link = self.ensure_link().await?;
        self.call_on(&link, op).await
    }
}

fn expect_row(reply: Reply) -> Result<Value, RemoteError> {
    match reply {
        Reply::Row(row) => Ok(serde_json::from_str(&row)?),
        other => Err(RemoteError::Rejected(format!("unexpected reply: {other:?}"))),
    }
}

impl RemoteStore for WsRemote {
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError> {
        let row = serde_json::to_string(&row)?;
        expect_row(self.call(Op::Insert { table, row }).await?)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError> {
        let patch = serde_json::to_string(&patch)?;
        let op = Op::Update {
            table,
            id: id.to_string(),
            patch,
        };
        expect_row(self.call(op).await?)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        let op = Op::Delete {
            table,
            id: id.to_string(),
        };
        match self.call(op).await? {
            Reply::Done => Ok(()),
            other => Err(RemoteError::Rejected(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn fetch_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Value>, RemoteError> {
        let op = Op::FetchSince {
            table,
            since: since.as_ref().map(stamp::format),
            limit,
        };
        match self.call(op).await? {
            Reply::Rows(rows) => rows
                .iter()
                .map(|row| serde_json::from_str(row).map_err(RemoteError::from))
                .collect(),
            other => Err(RemoteError::Rejected(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn subscribe(&self, table: Table) -> broadcast::Receiver<RemoteChange> {
        let rx = match self.feeds.get(&table) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        self.subscribed.lock().insert(table);
        if let Err(e) = self.call(Op::Subscribe { table }).await {
            tracing::warn!(%table, error = %e, "remote subscribe failed, will retry on reconnect");
        }
        rx
    }

    fn feed_live(&self) -> bool {
        !self.subscribed.lock().is_empty() && self.is_connected()
    }
}

/// Forwards encoded frames to the socket until the channel or socket closes.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
            tracing::warn!(err = %e, "remote send failed");
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
}

/// Routes replies to their waiting callers and changes to the feeds.
///
/// Malformed frames are logged and skipped. On exit the link is marked
/// down and every waiting caller sees [`RemoteError::ConnectionClosed`].
async fn reader_loop(
    mut ws_reader: WsReader,
    pending: Pending,
    feeds: BTreeMap<Table, broadcast::Sender<RemoteChange>>,
    connected: Arc<AtomicBool>,
    max_frame_size: usize,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match codec::decode_bounded::<ServerFrame>(&data, max_frame_size) {
                Ok(ServerFrame::Reply { request_id, reply }) => {
                    if let Some(tx) = pending.lock().remove(&request_id) {
                        let _ = tx.send(reply);
                    } else {
                        tracing::debug!(request_id, "reply for unknown request");
                    }
                }
                Ok(ServerFrame::Change {
                    table,
                    kind,
                    id,
                    row,
                }) => {
                    let row = match row.as_deref().map(serde_json::from_str::<Value>).transpose() {
                        Ok(row) => row,
                        Err(e) => {
                            tracing::warn!(%table, %id, err = %e, "change with malformed row, skipping");
                            continue;
                        }
                    };
                    if let Some(tx) = feeds.get(&table) {
                        let _ = tx.send(RemoteChange {
                            table,
                            kind,
                            id,
                            row,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed server frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("remote WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "remote WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::info!("remote reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`RemoteError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> RemoteError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            RemoteError::Rejected(format!("HTTP status {}", response.status()))
        }
        WsError::Url(e) => RemoteError::InvalidUrl(format!("{url}: {e}")),
        other => RemoteError::Unreachable(format!("{url}: {other}")),
    }
}
