//! Durable local storage for canonical collections.
//!
//! Defines the [`RecordStore`] trait with two implementations:
//! - [`blob::BlobStore`]: one sled key per record kind holding the whole
//!   JSON-serialized collection. Always available.
//! - [`sql::SqlStore`]: one `SQLite` table per record kind with row-shaped
//!   columns. Optional; used for the efficient startup query.
//!
//! [`DurableStore`] composes the two. The blob copy is authoritative: it
//! seeds every collection it can be read for, and a SQL table that missed
//! a write is rewritten from it wholesale.
//!
//! Records cross this boundary as canonical camelCase JSON objects.

pub mod blob;
pub mod sql;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use opsync_proto::peer::{MESSAGES_CHANNEL, TASKS_CHANNEL};
use opsync_proto::remote::Table;
use parking_lot::Mutex;
use serde_json::Value;

use blob::BlobStore;
use sql::SqlStore;

/// Errors that can occur during local storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The sled blob store failed.
    #[error("blob store error: {0}")]
    Blob(#[from] sled::Error),

    /// The `SQLite` store failed.
    #[error("sql store error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A stored collection could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record handed to the store is missing required fields.
    #[error("malformed {kind} record: {reason}")]
    Malformed {
        /// Kind of the offending record.
        kind: RecordKind,
        /// What was wrong.
        reason: String,
    },

    /// The store directory could not be created.
    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        /// Directory that was attempted.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// The record types kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// The shared task list.
    Tasks,
    /// The message stream.
    Messages,
}

impl RecordKind {
    /// Namespaced blob-store key holding the serialized collection.
    #[must_use]
    pub const fn blob_key(self) -> &'static str {
        match self {
            Self::Tasks => "opsync:tasks",
            Self::Messages => "opsync:messages",
        }
    }

    /// Remote table (and `SQLite` table) for this kind.
    #[must_use]
    pub const fn table(self) -> Table {
        match self {
            Self::Tasks => Table::Tasks,
            Self::Messages => Table::Messages,
        }
    }

    /// Peer channel carrying this kind.
    #[must_use]
    pub const fn channel(self) -> &'static str {
        match self {
            Self::Tasks => TASKS_CHANNEL,
            Self::Messages => MESSAGES_CHANNEL,
        }
    }

    /// Maps a peer channel name back to a kind.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            TASKS_CHANNEL => Some(Self::Tasks),
            MESSAGES_CHANNEL => Some(Self::Messages),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table().as_str())
    }
}

/// Persistent, key-indexed storage for canonical collections.
///
/// Implementations must be idempotent: upserting the same record twice or
/// deleting an absent id leaves the store unchanged.
pub trait RecordStore: Send + Sync {
    /// Read every stored record of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage cannot be read.
    fn read_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError>;

    /// Replace the whole stored collection of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage cannot be written.
    fn write_all(&self, kind: RecordKind, records: &[Value]) -> Result<(), StoreError>;

    /// Insert or replace one record, keyed by its `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure or a record without an id.
    fn upsert_row(&self, kind: RecordKind, record: &Value) -> Result<(), StoreError>;

    /// Delete one record by id. Deleting an absent id succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn delete_row(&self, kind: RecordKind, id: &str) -> Result<(), StoreError>;

    /// Return up to `limit` records, newest `createdAt` first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage cannot be read.
    fn query_recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<Value>, StoreError>;

    /// Delete records created before `cutoff`, returning how many went.
    ///
    /// Stores that are always rewritten whole may rely on the writer to
    /// prune and keep this default.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn prune_before(&self, _kind: RecordKind, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Extracts the `id` string of a canonical record.
pub(crate) fn record_id(kind: RecordKind, record: &Value) -> Result<&str, StoreError> {
    record
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StoreError::Malformed {
            kind,
            reason: "missing id".to_string(),
        })
}

/// Blob store plus optional queryable store, written together.
pub struct DurableStore {
    blob: Box<dyn RecordStore>,
    sql: Option<Box<dyn RecordStore>>,
    /// Kinds whose SQL table missed a write and must be rewritten whole.
    sql_stale: Mutex<HashSet<RecordKind>>,
}

impl DurableStore {
    /// Compose a store from explicit backends.
    #[must_use]
    pub fn new(blob: Box<dyn RecordStore>, sql: Option<Box<dyn RecordStore>>) -> Self {
        Self {
            blob,
            sql,
            sql_stale: Mutex::new(HashSet::new()),
        }
    }

    /// Open both stores under `dir`.
    ///
    /// The blob store is mandatory. When `sqlite` is set, the `SQLite`
    /// database is opened too; if that fails the store runs blob-only.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or the blob store cannot be opened.
    pub fn open(dir: &Path, sqlite: bool) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let blob = BlobStore::open(dir.join("blob"))?;
        let sql: Option<Box<dyn RecordStore>> = if sqlite {
            match SqlStore::open(dir.join("opsync.sqlite3")) {
                Ok(store) => Some(Box::new(store)),
                Err(e) => {
                    tracing::warn!(error = %e, "sqlite store unavailable, running blob-only");
                    None
                }
            }
        } else {
            None
        };
        tracing::info!(dir = %dir.display(), sqlite = sql.is_some(), "local store opened");
        Ok(Self::new(Box::new(blob), sql))
    }

    /// Open throwaway in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the temporary blob store cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let blob = BlobStore::temporary()?;
        let sql: Option<Box<dyn RecordStore>> = match SqlStore::open_in_memory() {
            Ok(store) => Some(Box::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, "in-memory sqlite unavailable");
                None
            }
        };
        Ok(Self::new(Box::new(blob), sql))
    }

    /// Whether the queryable store is present.
    #[must_use]
    pub fn has_sql(&self) -> bool {
        self.sql.is_some()
    }

    /// Records used to seed a canonical collection on startup.
    ///
    /// The blob collection wins whenever it can be read, and the SQL table
    /// is brought back in line with it if the two disagree. Only when the
    /// blob store is unreadable does the SQL copy seed the collection.
    pub fn load(&self, kind: RecordKind) -> Vec<Value> {
        let blob = self.blob.read_all(kind);
        let Some(sql) = &self.sql else {
            return blob.unwrap_or_else(|e| {
                tracing::warn!(%kind, error = %e, "blob store unreadable, starting empty");
                Vec::new()
            });
        };
        match blob {
            Ok(records) => {
                if !same_ids(sql.read_all(kind).ok().as_deref(), &records) {
                    tracing::info!(%kind, count = records.len(), "sql copy out of date, resyncing");
                    self.sync_sql(&**sql, kind, &records);
                }
                records
            }
            Err(e) => {
                tracing::warn!(%kind, error = %e, "blob store unreadable, seeding from sql");
                sql.read_all(kind).unwrap_or_else(|e| {
                    tracing::warn!(%kind, error = %e, "sql read failed too, starting empty");
                    Vec::new()
                })
            }
        }
    }

    /// The `limit` most recent records, newest first.
    ///
    /// Served by the SQL table when it is present and current, otherwise
    /// by the blob store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the blob store cannot be read.
    pub fn query_recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<Value>, StoreError> {
        if let Some(sql) = &self.sql
            && !self.is_stale(kind)
        {
            match sql.query_recent(kind, limit) {
                Ok(records) => return Ok(records),
                Err(e) => tracing::warn!(%kind, error = %e, "sql recent query failed, using blob copy"),
            }
        }
        self.blob.query_recent(kind, limit)
    }

    /// Read the authoritative (blob) collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the blob store cannot be read.
    pub fn read_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        self.blob.read_all(kind)
    }

    /// Overwrite both stores with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the blob write fails. SQL failures are
    /// logged only.
    pub fn write_all(&self, kind: RecordKind, records: &[Value]) -> Result<(), StoreError> {
        self.blob.write_all(kind, records)?;
        if let Some(sql) = &self.sql {
            self.sync_sql(&**sql, kind, records);
        }
        Ok(())
    }

    /// Persist one upserted record: whole collection to the blob store,
    /// one row to the queryable store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the blob write fails.
    pub fn persist_upsert(
        &self,
        kind: RecordKind,
        collection: &[Value],
        record: &Value,
    ) -> Result<(), StoreError> {
        self.blob.write_all(kind, collection)?;
        let Some(sql) = &self.sql else {
            return Ok(());
        };
        if self.is_stale(kind) {
            self.sync_sql(&**sql, kind, collection);
        } else if let Err(e) = sql.upsert_row(kind, record) {
            tracing::warn!(%kind, error = %e, "sql upsert failed, table marked stale");
            self.sql_stale.lock().insert(kind);
        }
        Ok(())
    }

    /// Persist one deletion: whole collection to the blob store, row
    /// delete on the queryable store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the blob write fails.
    pub fn persist_delete(
        &self,
        kind: RecordKind,
        collection: &[Value],
        id: &str,
    ) -> Result<(), StoreError> {
        self.blob.write_all(kind, collection)?;
        let Some(sql) = &self.sql else {
            return Ok(());
        };
        if self.is_stale(kind) {
            self.sync_sql(&**sql, kind, collection);
        } else if let Err(e) = sql.delete_row(kind, id) {
            tracing::warn!(%kind, id, error = %e, "sql delete failed, table marked stale");
            self.sql_stale.lock().insert(kind);
        }
        Ok(())
    }

    /// Drop archived rows from the queryable store.
    ///
    /// The blob copy is pruned by the writer; this keeps the table from
    /// growing past the archive window.
    pub fn prune_before(&self, kind: RecordKind, cutoff: DateTime<Utc>) -> usize {
        let Some(sql) = &self.sql else {
            return 0;
        };
        match sql.prune_before(kind, cutoff) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%kind, error = %e, "sql archive prune failed");
                0
            }
        }
    }
}

impl DurableStore {
    fn is_stale(&self, kind: RecordKind) -> bool {
        self.sql_stale.lock().contains(&kind)
    }

    /// Rewrites the SQL table from `records`, tracking whether it is current.
    fn sync_sql(&self, sql: &dyn RecordStore, kind: RecordKind, records: &[Value]) {
        match sql.write_all(kind, records) {
            Ok(()) => {
                self.sql_stale.lock().remove(&kind);
            }
            Err(e) => {
                tracing::warn!(%kind, error = %e, "sql rewrite failed, table marked stale");
                self.sql_stale.lock().insert(kind);
            }
        }
    }
}

fn same_ids(sql: Option<&[Value]>, blob: &[Value]) -> bool {
    let ids = |records: &[Value]| -> HashSet<String> {
        records
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
            .collect()
    };
    sql.is_some_and(|sql| sql.len() == blob.len() && ids(sql) == ids(blob))
}

impl fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableStore")
            .field("sql", &self.sql.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A store that fails every call while `failing` is set.
    pub(crate) struct FailingStore {
        pub(crate) inner: BlobStore,
        pub(crate) failing: Arc<AtomicBool>,
    }

    impl FailingStore {
        pub(crate) fn new(failing: Arc<AtomicBool>) -> Self {
            Self::over(BlobStore::temporary().unwrap(), failing)
        }

        /// Wraps an existing store so a second instance can see its rows.
        pub(crate) fn over(inner: BlobStore, failing: Arc<AtomicBool>) -> Self {
            Self { inner, failing }
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Malformed {
                    kind: RecordKind::Tasks,
                    reason: "injected failure".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl RecordStore for FailingStore {
        fn read_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
            self.check()?;
            self.inner.read_all(kind)
        }
        fn write_all(&self, kind: RecordKind, records: &[Value]) -> Result<(), StoreError> {
            self.check()?;
            self.inner.write_all(kind, records)
        }
        fn upsert_row(&self, kind: RecordKind, record: &Value) -> Result<(), StoreError> {
            self.check()?;
            self.inner.upsert_row(kind, record)
        }
        fn delete_row(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_row(kind, id)
        }
        fn query_recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<Value>, StoreError> {
            self.check()?;
            self.inner.query_recent(kind, limit)
        }
    }

    fn task(id: &str, created_at: &str) -> Value {
        json!({ "id": id, "text": "t", "createdAt": created_at, "completed": false })
    }

    #[test]
    fn kind_names() {
        assert_eq!(RecordKind::Tasks.blob_key(), "opsync:tasks");
        assert_eq!(RecordKind::Messages.blob_key(), "opsync:messages");
        assert_eq!(RecordKind::Messages.table(), Table::Messages);
        assert_eq!(
            RecordKind::from_channel("opsync:tasks"),
            Some(RecordKind::Tasks)
        );
        assert_eq!(RecordKind::from_channel("bookings"), None);
    }

    #[test]
    fn sql_failure_keeps_blob_authoritative() {
        let failing = Arc::new(AtomicBool::new(true));
        let store = DurableStore::new(
            Box::new(BlobStore::temporary().unwrap()),
            Some(Box::new(FailingStore::new(Arc::clone(&failing)))),
        );
        let records = vec![task("a", "2026-03-01T10:00:00Z")];
        store
            .persist_upsert(RecordKind::Tasks, &records, &records[0])
            .unwrap();
        assert_eq!(store.read_all(RecordKind::Tasks).unwrap(), records);

        // load serves the blob copy while the SQL side fails.
        assert_eq!(store.load(RecordKind::Tasks), records);
    }

    #[test]
    fn blob_failure_is_reported() {
        let failing = Arc::new(AtomicBool::new(true));
        let store = DurableStore::new(Box::new(FailingStore::new(failing)), None);
        let records = vec![task("a", "2026-03-01T10:00:00Z")];
        assert!(store.write_all(RecordKind::Tasks, &records).is_err());
        assert!(store.load(RecordKind::Tasks).is_empty());
    }

    #[test]
    fn load_returns_whole_blob_collection() {
        let store = DurableStore::in_memory().unwrap();
        assert!(store.has_sql());
        let records = vec![
            task("new", "2026-03-02T10:00:00Z"),
            task("old", "2026-03-01T10:00:00Z"),
        ];
        store.write_all(RecordKind::Tasks, &records).unwrap();

        assert_eq!(store.load(RecordKind::Tasks), records);
        let recent = store.query_recent(RecordKind::Tasks, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0]["id"], "new");
    }

    #[test]
    fn load_falls_back_when_sql_is_empty_but_blob_is_not() {
        let blob = BlobStore::temporary().unwrap();
        let records = vec![task("a", "2026-03-01T10:00:00Z")];
        blob.write_all(RecordKind::Tasks, &records).unwrap();
        let store = DurableStore::new(
            Box::new(blob),
            Some(Box::new(SqlStore::open_in_memory().unwrap())),
        );
        assert_eq!(store.load(RecordKind::Tasks), records);
    }

    #[test]
    fn restart_after_missed_sql_write_loads_blob_and_resyncs() {
        let blob = BlobStore::temporary().unwrap();
        let rows = BlobStore::temporary().unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let first = DurableStore::new(
            Box::new(blob.clone()),
            Some(Box::new(FailingStore::over(rows.clone(), Arc::clone(&failing)))),
        );
        let one = vec![task("a", "2026-03-01T10:00:00Z")];
        first.persist_upsert(RecordKind::Tasks, &one, &one[0]).unwrap();

        failing.store(true, Ordering::SeqCst);
        let two = vec![one[0].clone(), task("b", "2026-03-01T11:00:00Z")];
        first.persist_upsert(RecordKind::Tasks, &two, &two[1]).unwrap();
        failing.store(false, Ordering::SeqCst);
        drop(first);
        assert_eq!(rows.read_all(RecordKind::Tasks).unwrap(), one);

        // A non-empty but stale SQL table must not shadow the blob copy.
        let second = DurableStore::new(
            Box::new(blob),
            Some(Box::new(FailingStore::over(rows.clone(), failing))),
        );
        assert_eq!(second.load(RecordKind::Tasks), two);
        assert_eq!(rows.read_all(RecordKind::Tasks).unwrap(), two);
    }

    #[test]
    fn write_after_missed_sql_write_rewrites_table() {
        let rows = BlobStore::temporary().unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let store = DurableStore::new(
            Box::new(BlobStore::temporary().unwrap()),
            Some(Box::new(FailingStore::over(rows.clone(), Arc::clone(&failing)))),
        );
        let one = vec![task("a", "2026-03-01T10:00:00Z")];
        store.persist_upsert(RecordKind::Tasks, &one, &one[0]).unwrap();

        failing.store(true, Ordering::SeqCst);
        let two = vec![one[0].clone(), task("b", "2026-03-01T11:00:00Z")];
        store.persist_upsert(RecordKind::Tasks, &two, &two[1]).unwrap();
        failing.store(false, Ordering::SeqCst);

        // Stale table: recent queries come from the blob copy.
        let recent = store.query_recent(RecordKind::Tasks, 10).unwrap();
        assert_eq!(recent.len(), 2);

        let three = vec![
            two[0].clone(),
            two[1].clone(),
            task("c", "2026-03-01T12:00:00Z"),
        ];
        store
            .persist_upsert(RecordKind::Tasks, &three, &three[2])
            .unwrap();
        assert_eq!(rows.read_all(RecordKind::Tasks).unwrap(), three);
    }

    #[test]
    fn open_on_disk_creates_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(&dir.path().join("data"), true).unwrap();
        assert!(store.has_sql());
        let blob_only = DurableStore::open(&dir.path().join("other"), false).unwrap();
        assert!(!blob_only.has_sql());
    }
}
