//! Wire protocol between sync clients and the remote realtime store.
//!
//! Clients send [`Request`] frames and receive [`ServerFrame`]s: either a
//! [`ServerFrame::Reply`] correlated by `request_id`, or an unsolicited
//! [`ServerFrame::Change`] for a table the client subscribed to.
//!
//! Rows are snake_case JSON objects carried as strings. Postcard is not
//! self-describing, so it cannot encode `serde_json::Value` directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A table held by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    /// The shared task list.
    Tasks,
    /// The message stream.
    Messages,
}

impl Table {
    /// All tables, in a fixed order.
    pub const ALL: [Self; 2] = [Self::Tasks, Self::Messages];

    /// Returns the table name used in rows, SQL and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Messages => "messages",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tasks" => Ok(Self::Tasks),
            "messages" => Ok(Self::Messages),
            other => Err(format!("unknown table: {other}")),
        }
    }
}

/// A client request, correlated with its reply by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id, unique per connection.
    pub request_id: u64,
    /// The operation to perform.
    pub op: Op,
}

/// Operations a client can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Insert a row. A row without an `id` gets one assigned by the server.
    ///
    /// Replies with [`Reply::Row`] holding the stored row.
    Insert {
        /// Target table.
        table: Table,
        /// Row as a JSON object.
        row: String,
    },
    /// Merge `patch` into the row with `id`.
    ///
    /// Replies with [`Reply::Row`], or [`Reply::Failed`] if the row is absent.
    Update {
        /// Target table.
        table: Table,
        /// Row id.
        id: String,
        /// Partial row as a JSON object.
        patch: String,
    },
    /// Delete the row with `id`. Deleting an absent row succeeds.
    Delete {
        /// Target table.
        table: Table,
        /// Row id.
        id: String,
    },
    /// Fetch rows created at or after `since`, newest first.
    ///
    /// Replies with [`Reply::Rows`].
    FetchSince {
        /// Target table.
        table: Table,
        /// RFC 3339 lower bound on `created_at`; `None` fetches everything.
        since: Option<String>,
        /// Maximum number of rows to return.
        limit: u32,
    },
    /// Start receiving [`ServerFrame::Change`] frames for `table`.
    Subscribe {
        /// Table to watch.
        table: Table,
    },
}

impl Op {
    /// Returns the table this operation targets.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::FetchSince { table, .. }
            | Self::Subscribe { table } => *table,
        }
    }
}

/// Outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// The operation succeeded with nothing to return.
    Done,
    /// The operation succeeded and produced one row.
    Row(String),
    /// The operation succeeded and produced a list of rows.
    Rows(Vec<String>),
    /// The operation was rejected.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Kind of mutation reported by a change frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Reply to a client request.
    Reply {
        /// Correlation id echoed from the request.
        request_id: u64,
        /// Outcome.
        reply: Reply,
    },
    /// A row in a subscribed table changed.
    Change {
        /// Table that changed.
        table: Table,
        /// What happened.
        kind: ChangeKind,
        /// Id of the affected row.
        id: String,
        /// The row after the change; `None` for deletes.
        row: Option<String>,
    },
}
