//! `SQLite` store: one table per record kind, columns in row shape.

use std::path::Path;

use chrono::{DateTime, Utc};
use opsync_proto::{Message, Task, stamp};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};
use serde_json::Value;

use super::{RecordKind, RecordStore, StoreError, record_id};
use crate::remote::rows::{MessageRow, TaskRow};

const CREATE_TASKS: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    text         TEXT NOT NULL,
    assigned_to  TEXT NOT NULL DEFAULT '',
    target_role  TEXT NOT NULL DEFAULT 'all',
    completed    INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    completed_by TEXT,
    created_at   TEXT NOT NULL,
    created_by   TEXT
)";

const CREATE_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY,
    content      TEXT NOT NULL,
    sender_id    TEXT,
    sender_name  TEXT NOT NULL DEFAULT '',
    sender_role  TEXT NOT NULL DEFAULT '',
    recipient_id TEXT,
    message_type TEXT NOT NULL DEFAULT 'text',
    created_at   TEXT NOT NULL,
    is_read      INTEGER NOT NULL DEFAULT 0
)";

const UPSERT_TASK: &str = "INSERT INTO tasks
    (id, text, assigned_to, target_role, completed, completed_at, completed_by, created_at, created_by)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(id) DO UPDATE SET
        text = excluded.text,
        assigned_to = excluded.assigned_to,
        target_role = excluded.target_role,
        completed = excluded.completed,
        completed_at = excluded.completed_at,
        completed_by = excluded.completed_by,
        created_at = excluded.created_at,
        created_by = excluded.created_by";

const UPSERT_MESSAGE: &str = "INSERT INTO messages
    (id, content, sender_id, sender_name, sender_role, recipient_id, message_type, created_at, is_read)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(id) DO UPDATE SET
        content = excluded.content,
        sender_id = excluded.sender_id,
        sender_name = excluded.sender_name,
        sender_role = excluded.sender_role,
        recipient_id = excluded.recipient_id,
        message_type = excluded.message_type,
        created_at = excluded.created_at,
        is_read = excluded.is_read";

const SELECT_TASKS: &str = "SELECT id, text, assigned_to, target_role, completed, completed_at, \
     completed_by, created_at, created_by FROM tasks";

const SELECT_MESSAGES: &str = "SELECT id, content, sender_id, sender_name, sender_role, \
     recipient_id, message_type, created_at, is_read FROM messages";

struct Inner {
    conn: Connection,
    tasks_ready: bool,
    messages_ready: bool,
}

impl Inner {
    /// Returns the connection after making sure `kind`'s table exists.
    fn table(&mut self, kind: RecordKind) -> Result<&Connection, StoreError> {
        let ready = match kind {
            RecordKind::Tasks => &mut self.tasks_ready,
            RecordKind::Messages => &mut self.messages_ready,
        };
        if !*ready {
            let ddl = match kind {
                RecordKind::Tasks => CREATE_TASKS,
                RecordKind::Messages => CREATE_MESSAGES,
            };
            self.conn.execute(ddl, [])?;
            *ready = true;
        }
        Ok(&self.conn)
    }
}

/// Queryable store backed by a single `SQLite` connection.
///
/// Timestamps are stored as fixed-width RFC 3339 strings
/// (`YYYY-MM-DDTHH:MM:SS.mmmZ`) so text ordering matches time ordering.
pub struct SqlStore {
    inner: Mutex<Inner>,
}

impl SqlStore {
    /// Open or create the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sql`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(Self::with_connection(conn))
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sql`] if `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::with_connection(Connection::open_in_memory()?))
    }

    const fn with_connection(conn: Connection) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conn,
                tasks_ready: false,
                messages_ready: false,
            }),
        }
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        text: row.get(1)?,
        assigned_to: row.get(2)?,
        target_role: row.get(3)?,
        completed: row.get(4)?,
        completed_at: row.get(5)?,
        completed_by: row.get(6)?,
        created_at: row.get(7)?,
        created_by: row.get(8)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        sender_role: row.get(4)?,
        recipient_id: row.get(5)?,
        message_type: row.get(6)?,
        created_at: row.get(7)?,
        is_read: row.get(8)?,
    })
}

fn malformed(kind: RecordKind, record: &Value) -> StoreError {
    StoreError::Malformed {
        kind,
        reason: match record.get("id").and_then(Value::as_str) {
            Some(id) => format!("record {id} does not parse"),
            None => "record does not parse".to_string(),
        },
    }
}

fn upsert(conn: &Connection, kind: RecordKind, record: &Value) -> Result<(), StoreError> {
    record_id(kind, record)?;
    let now = Utc::now();
    match kind {
        RecordKind::Tasks => {
            let task = Task::from_json(record, now).ok_or_else(|| malformed(kind, record))?;
            let r = TaskRow::from(&task);
            conn.execute(
                UPSERT_TASK,
                params![
                    r.id,
                    r.text,
                    r.assigned_to,
                    r.target_role,
                    r.completed,
                    r.completed_at,
                    r.completed_by,
                    r.created_at,
                    r.created_by
                ],
            )?;
        }
        RecordKind::Messages => {
            let msg = Message::from_json(record, now).ok_or_else(|| malformed(kind, record))?;
            let r = MessageRow::from(&msg);
            conn.execute(
                UPSERT_MESSAGE,
                params![
                    r.id,
                    r.content,
                    r.sender_id,
                    r.sender_name,
                    r.sender_role,
                    r.recipient_id,
                    r.message_type,
                    r.created_at,
                    r.is_read
                ],
            )?;
        }
    }
    Ok(())
}

/// Runs `sql` (a SELECT with an optional tail) and returns canonical JSON.
fn select(
    conn: &Connection,
    kind: RecordKind,
    tail: &str,
    limit: Option<i64>,
) -> Result<Vec<Value>, StoreError> {
    let now = Utc::now();
    let base = match kind {
        RecordKind::Tasks => SELECT_TASKS,
        RecordKind::Messages => SELECT_MESSAGES,
    };
    let mut stmt = conn.prepare(&format!("{base} {tail}"))?;
    let params: Vec<i64> = limit.into_iter().collect();
    let values = match kind {
        RecordKind::Tasks => stmt
            .query_map(rusqlite::params_from_iter(params), task_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|r| serde_json::to_value(r.into_task(now)))
            .collect::<Result<Vec<_>, _>>()?,
        RecordKind::Messages => stmt
            .query_map(rusqlite::params_from_iter(params), message_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|r| serde_json::to_value(r.into_message(now)))
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(values)
}

impl RecordStore for SqlStore {
    fn read_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        let mut inner = self.inner.lock();
        let conn = inner.table(kind)?;
        select(conn, kind, "ORDER BY rowid", None)
    }

    fn write_all(&self, kind: RecordKind, records: &[Value]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.table(kind)?;
        let tx = inner.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", kind.table()), [])?;
        for record in records {
            upsert(&tx, kind, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_row(&self, kind: RecordKind, record: &Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let conn = inner.table(kind)?;
        upsert(conn, kind, record)
    }

    fn delete_row(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let conn = inner.table(kind)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![id],
        )?;
        Ok(())
    }

    fn query_recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<Value>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut inner = self.inner.lock();
        let conn = inner.table(kind)?;
        select(conn, kind, "ORDER BY created_at DESC LIMIT ?1", Some(limit))
    }

    fn prune_before(&self, kind: RecordKind, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let conn = inner.table(kind)?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE created_at < ?1", kind.table()),
            params![stamp::format(&cutoff)],
        )?;
        if removed > 0 {
            tracing::debug!(%kind, removed, "pruned archived rows");
        }
        Ok(removed)
    }
}
