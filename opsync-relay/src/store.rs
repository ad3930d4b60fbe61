//! In-memory table storage for the relay.
//!
//! One [`RowTable`] per [`Table`], behind a [`RwLock`]. Rows do not
//! survive a restart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use opsync_proto::remote::Table;
use opsync_proto::table::{RowError, RowTable};
use serde_json::Value;
use tokio::sync::RwLock;

/// Every table the relay serves.
#[derive(Default)]
pub struct TableStore {
    tables: RwLock<BTreeMap<Table, RowTable>>,
}

impl TableStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row, assigning an id and `created_at` when missing.
    ///
    /// # Errors
    ///
    /// Returns [`RowError`] if `row` is not an object.
    pub async fn insert(&self, table: Table, row: Value) -> Result<Value, RowError> {
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .insert(row, Utc::now())
    }

    /// Merges `patch` into the row with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RowError`] if the row is absent or the patch is not an object.
    pub async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RowError> {
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .update(id, patch)
    }

    /// Deletes the row with `id`, returning whether it existed.
    pub async fn delete(&self, table: Table, id: &str) -> bool {
        self.tables
            .write()
            .await
            .get_mut(&table)
            .is_some_and(|t| t.delete(id))
    }

    /// Up to `limit` rows created at or after `since`, newest first.
    pub async fn fetch_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<Value> {
        self.tables
            .read()
            .await
            .get(&table)
            .map(|t| t.fetch_since(since, limit))
            .unwrap_or_default()
    }

    /// Number of rows in `table`.
    pub async fn len(&self, table: Table) -> usize {
        self.tables.read().await.get(&table).map_or(0, RowTable::len)
    }
}
