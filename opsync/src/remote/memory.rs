//! In-process remote store for tests and offline demos.
//!
//! Behaves like the relay: ids are assigned on insert, updates merge, and
//! every write is announced on the push feed. Two switches simulate
//! failure: [`MemoryRemote::set_online`] makes every call fail as
//! unreachable, and [`MemoryRemote::set_feed`] silences the push feed so
//! only polling observes changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use opsync_proto::remote::{ChangeKind, Table};
use opsync_proto::table::{RowError, RowTable};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{RemoteChange, RemoteError, RemoteStore};

/// Capacity of each table's change channel.
const FEED_CAPACITY: usize = 256;

/// Remote store held in memory.
pub struct MemoryRemote {
    tables: Mutex<BTreeMap<Table, RowTable>>,
    feeds: BTreeMap<Table, broadcast::Sender<RemoteChange>>,
    online: AtomicBool,
    feed: AtomicBool,
    calls: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates an empty, online remote with a live feed.
    #[must_use]
    pub fn new() -> Self {
        let feeds = Table::ALL
            .into_iter()
            .map(|t| (t, broadcast::channel(FEED_CAPACITY).0))
            .collect();
        Self {
            tables: Mutex::new(BTreeMap::new()),
            feeds,
            online: AtomicBool::new(true),
            feed: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// While `false`, every call fails with [`RemoteError::Unreachable`]
    /// and the feed is down.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// While `false`, writes still land but no change is pushed.
    pub fn set_feed(&self, live: bool) {
        self.feed.store(live, Ordering::SeqCst);
    }

    /// Number of calls attempted, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every row of `table`, newest first.
    #[must_use]
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .get(&table)
            .map(|t| t.fetch_since(None, usize::MAX))
            .unwrap_or_default()
    }

    /// Writes a row directly, as another client would, and announces it.
    pub fn seed(&self, table: Table, row: Value) -> Option<Value> {
        let stored = self
            .tables
            .lock()
            .entry(table)
            .or_default()
            .insert(row, Utc::now())
            .ok()?;
        self.announce(table, ChangeKind::Insert, &stored);
        Some(stored)
    }

    fn check(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("memory remote is offline".into()))
        }
    }

    fn announce(&self, table: Table, kind: ChangeKind, row: &Value) {
        if !self.feed_live() {
            return;
        }
        let Some(id) = row.get("id").and_then(Value::as_str) else {
            return;
        };
        if let Some(tx) = self.feeds.get(&table) {
            let _ = tx.send(RemoteChange {
                table,
                kind,
                id: id.to_string(),
                row: (kind != ChangeKind::Delete).then(|| row.clone()),
            });
        }
    }
}

fn rejected(e: &RowError) -> RemoteError {
    RemoteError::Rejected(e.to_string())
}

impl RemoteStore for MemoryRemote {
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError> {
        self.check()?;
        let stored = self
            .tables
            .lock()
            .entry(table)
            .or_default()
            .insert(row, Utc::now())
            .map_err(|e| rejected(&e))?;
        self.announce(table, ChangeKind::Insert, &stored);
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError> {
        self.check()?;
        let stored = self
            .tables
            .lock()
            .entry(table)
            .or_default()
            .update(id, patch)
            .map_err(|e| rejected(&e))?;
        self.announce(table, ChangeKind::Update, &stored);
        Ok(stored)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        self.check()?;
        let existed = self.tables.lock().entry(table).or_default().delete(id);
        if existed {
            self.announce(table, ChangeKind::Delete, &serde_json::json!({ "id": id }));
        }
        Ok(())
    }

    async fn fetch_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Value>, RemoteError> {
        self.check()?;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .tables
            .lock()
            .get(&table)
            .map(|t| t.fetch_since(since, limit))
            .unwrap_or_default())
    }

    async fn subscribe(&self, table: Table) -> broadcast::Receiver<RemoteChange> {
        match self.feeds.get(&table) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn feed_live(&self) -> bool {
        self.online.load(Ordering::SeqCst) && self.feed.load(Ordering::SeqCst)
    }
}
