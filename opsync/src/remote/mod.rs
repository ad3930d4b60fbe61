//! Remote realtime store abstraction.
//!
//! Defines the [`RemoteStore`] trait that every remote adapter satisfies.
//! Concrete implementations:
//! - [`ws::WsRemote`]: WebSocket client for `opsync-relay`
//! - [`memory::MemoryRemote`]: in-process store with switchable failures, for tests
//!
//! Rows crossing this boundary are snake_case JSON objects; see [`rows`]
//! for the translation from canonical records. [`poll`] implements the
//! pull fallback used while the push feed is down.

pub mod memory;
pub mod poll;
pub mod rows;
pub mod ws;

use chrono::{DateTime, Utc};
use opsync_proto::codec::WireError;
use opsync_proto::remote::{ChangeKind, Table};
use serde_json::Value;
use tokio::sync::broadcast;

/// Errors that can occur during remote store operations.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The call did not complete within the configured timeout.
    #[error("remote operation timed out")]
    Timeout,

    /// The configured URL is not a usable WebSocket URL.
    #[error("invalid remote url: {0}")]
    InvalidUrl(String),

    /// The remote could not be reached.
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    /// The link dropped while the call was in flight.
    #[error("remote connection closed")]
    ConnectionClosed,

    /// The remote refused the operation.
    #[error("remote rejected the operation: {0}")]
    Rejected(String),

    /// A wire frame could not be encoded or decoded.
    #[error("wire codec error: {0}")]
    Codec(#[from] WireError),

    /// A row was not valid JSON.
    #[error("row is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A mutation announced by the remote push feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    /// Table that changed.
    pub table: Table,
    /// Insert, update, or delete.
    pub kind: ChangeKind,
    /// Id of the changed row.
    pub id: String,
    /// The row after the change; `None` for deletes.
    pub row: Option<Value>,
}

/// Async interface to the authoritative remote store.
///
/// All mutating calls return as soon as the remote has answered; callers
/// bound them with their own timeout and never retry.
pub trait RemoteStore: Send + Sync + 'static {
    /// Insert a row. The remote assigns an id when the row carries none.
    ///
    /// Returns the row as stored.
    fn insert(
        &self,
        table: Table,
        row: Value,
    ) -> impl std::future::Future<Output = Result<Value, RemoteError>> + Send;

    /// Merge `patch` into the row with `id`.
    ///
    /// Returns the updated row.
    fn update(
        &self,
        table: Table,
        id: &str,
        patch: Value,
    ) -> impl std::future::Future<Output = Result<Value, RemoteError>> + Send;

    /// Delete the row with `id`. Deleting an absent row succeeds.
    fn delete(
        &self,
        table: Table,
        id: &str,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Up to `limit` rows created at or after `since`, newest first.
    fn fetch_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Value>, RemoteError>> + Send;

    /// Subscribe to the push feed of `table`.
    ///
    /// Never fails: if the feed cannot be established now, the receiver
    /// stays quiet until a later reconnect re-establishes it.
    fn subscribe(
        &self,
        table: Table,
    ) -> impl std::future::Future<Output = broadcast::Receiver<RemoteChange>> + Send;

    /// Whether the push feed is currently delivering changes.
    fn feed_live(&self) -> bool;
}
