//! sled-backed blob store: one key per record kind.

use std::path::Path;

use chrono::{DateTime, Utc};
use opsync_proto::stamp;
use serde_json::Value;

use super::{RecordKind, RecordStore, StoreError, record_id};

/// Whole-collection store over a sled database.
///
/// Row-level operations are read-modify-write of the serialized collection.
/// Collections are small, so this stays cheap. Clones share one database.
#[derive(Clone)]
pub struct BlobStore {
    db: sled::Db,
}

impl BlobStore {
    /// Open or create a blob store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Blob`] if sled cannot open the directory
    /// (for example when another process holds its lock).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }

    /// Create a store that is deleted when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Blob`] if the temporary database cannot be created.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

fn created_at(record: &Value) -> DateTime<Utc> {
    record
        .get("createdAt")
        .and_then(Value::as_str)
        .and_then(stamp::parse)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl RecordStore for BlobStore {
    fn read_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        match self.db.get(kind.blob_key())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_all(&self, kind: RecordKind, records: &[Value]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(records)?;
        self.db.insert(kind.blob_key(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    fn upsert_row(&self, kind: RecordKind, record: &Value) -> Result<(), StoreError> {
        let id = record_id(kind, record)?;
        let mut records = self.read_all(kind)?;
        match records
            .iter()
            .position(|r| r.get("id").and_then(Value::as_str) == Some(id))
        {
            Some(pos) => records[pos] = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_all(kind, &records)
    }

    fn delete_row(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        let mut records = self.read_all(kind)?;
        let before = records.len();
        records.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        if records.len() == before {
            return Ok(());
        }
        self.write_all(kind, &records)
    }

    fn query_recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<Value>, StoreError> {
        let mut records = self.read_all(kind)?;
        records.sort_by_key(|r| std::cmp::Reverse(created_at(r)));
        records.truncate(limit);
        Ok(records)
    }
}
