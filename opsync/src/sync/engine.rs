//! The synchronizer: one canonical collection, one persisted mirror.
//!
//! Every transport funnels into [`Synchronizer::upsert`],
//! [`Synchronizer::remove`], or [`Synchronizer::merge_batch`]. The
//! collection and its write to the [`DurableStore`] happen under one
//! `parking_lot::Mutex`; subscribers are notified after it is released,
//! so a handler may call back in.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use super::collection::Collection;
use super::record::Record;
use super::retention::RetentionPolicy;
use crate::store::DurableStore;

/// Which transport delivered a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A caller of this process.
    Local,
    /// The same-network peer channel.
    Peer,
    /// The remote store (push feed, poll, or a write reply).
    Remote,
}

/// A change observed by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent<T> {
    /// A record was inserted or replaced.
    Upsert(T),
    /// A record was removed.
    Delete(String),
    /// A batch changed the collection; re-read it.
    Sync,
}

/// Outcome of a single upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// New id.
    Inserted,
    /// Existing id overwritten.
    Replaced,
    /// A remote copy replaced the optimistic record `local_id`.
    Reconciled {
        /// Id of the optimistic record that was replaced.
        local_id: String,
    },
    /// Identical to what was already held; nothing written.
    Unchanged,
    /// Older than the archive cutoff; dropped.
    Archived,
}

/// Merge tunables shared by every synchronizer of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Archive and visibility windows.
    pub retention: RetentionPolicy,
    /// Window for matching a remote message to its optimistic copy.
    pub dedup_window: TimeDelta,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            dedup_window: TimeDelta::seconds(5),
        }
    }
}

type Handler<T> = Arc<dyn Fn(&SyncEvent<T>) + Send + Sync>;
type Handlers<T> = Mutex<Vec<(u64, Handler<T>)>>;

/// Handle returned by [`Synchronizer::subscribe`].
///
/// Dropping it keeps the handler registered; call
/// [`unsubscribe`](Self::unsubscribe) to stop receiving events.
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    cancel: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    /// Removes the handler.
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Canonical collection of one record type plus its durable mirror.
pub struct Synchronizer<T: Record> {
    items: Mutex<Collection<T>>,
    store: Arc<DurableStore>,
    policy: SyncPolicy,
    handlers: Arc<Handlers<T>>,
    next_handler: AtomicU64,
}

impl<T: Record> Synchronizer<T> {
    /// Seeds a synchronizer from the store.
    ///
    /// Loads the whole stored collection, drops malformed and archived
    /// ones, and writes the cleaned collection back if anything was dropped.
    /// Read-side caps belong to the views, never to the canonical copy.
    pub fn open(store: Arc<DurableStore>, policy: SyncPolicy) -> Self {
        let now = Utc::now();
        let raw = store.load(T::KIND);
        let total = raw.len();
        let parsed = raw.iter().filter_map(|value| {
            let record = T::from_json(value, now);
            if record.is_none() {
                tracing::debug!(kind = %T::KIND, "dropping malformed stored record");
            }
            record
        });
        let mut items = Collection::from_records(parsed.map(|mut r| {
            r.normalize();
            r
        }));
        let archived = items.prune(policy.retention.archive_cutoff(now));

        let sync = Self {
            items: Mutex::new(Collection::new()),
            store,
            policy,
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_handler: AtomicU64::new(1),
        };
        if items.len() != total {
            tracing::info!(
                kind = %T::KIND,
                loaded = total,
                kept = items.len(),
                archived,
                "cleaned stored collection"
            );
            sync.write_back(&items, now);
        }
        tracing::debug!(kind = %T::KIND, count = items.len(), "collection loaded");
        *sync.items.lock() = items;
        sync
    }

    /// The policy this synchronizer applies.
    #[must_use]
    pub const fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// The durable store behind this collection.
    #[must_use]
    pub const fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    /// Inserts or overwrites `record` (last observed write wins).
    ///
    /// A remote message that matches an optimistic local copy replaces it;
    /// see [`Record::is_echo_of`].
    pub fn upsert(&self, record: T, origin: Origin) -> Applied {
        let now = Utc::now();
        let (applied, record) = {
            let mut items = self.items.lock();
            let (applied, record) = self.apply(&mut items, record, origin, now);
            match &applied {
                Applied::Unchanged | Applied::Archived => {}
                Applied::Reconciled { local_id } => {
                    self.archive(&mut items, now);
                    self.persist_delete(&items, local_id);
                    self.persist_upsert(&items, &record);
                }
                Applied::Inserted | Applied::Replaced => {
                    self.archive(&mut items, now);
                    self.persist_upsert(&items, &record);
                }
            }
            (applied, record)
        };
        tracing::debug!(kind = %T::KIND, id = record.id(), ?origin, ?applied, "upsert");

        match &applied {
            Applied::Unchanged | Applied::Archived => {}
            Applied::Reconciled { local_id } => {
                self.notify(&SyncEvent::Delete(local_id.clone()));
                self.notify(&SyncEvent::Upsert(record));
            }
            Applied::Inserted | Applied::Replaced => self.notify(&SyncEvent::Upsert(record)),
        }
        applied
    }

    /// Removes the record with `id`. Returns `false` (and emits nothing)
    /// if it was not present.
    pub fn remove(&self, id: &str, origin: Origin) -> bool {
        let now = Utc::now();
        let removed = {
            let mut items = self.items.lock();
            let removed = items.remove(id).is_some();
            if removed {
                self.archive(&mut items, now);
                self.persist_delete(&items, id);
            }
            removed
        };
        tracing::debug!(kind = %T::KIND, id, ?origin, removed, "remove");
        if removed {
            self.notify(&SyncEvent::Delete(id.to_string()));
        }
        removed
    }

    /// Applies many records under one lock with a single write.
    ///
    /// Emits one [`SyncEvent::Sync`] and returns `true` only if the
    /// collection signature changed.
    pub fn merge_batch(&self, records: Vec<T>, origin: Origin) -> bool {
        let now = Utc::now();
        let count = records.len();
        let changed = {
            let mut items = self.items.lock();
            let before = items.signature();
            for record in records {
                self.apply(&mut items, record, origin, now);
            }
            items.prune(self.policy.retention.archive_cutoff(now));
            let changed = items.signature() != before;
            if changed {
                self.write_back(&items, now);
            }
            changed
        };
        tracing::debug!(kind = %T::KIND, ?origin, count, changed, "merge batch");
        if changed {
            self.notify(&SyncEvent::Sync);
        }
        changed
    }

    /// The rendered view: archive-pruned and visibility-filtered.
    #[must_use]
    pub fn get_all(&self) -> Vec<T> {
        let now = Utc::now();
        let visibility = self.policy.retention.visibility_cutoff(now);
        let mut items = self.items.lock();
        self.archive(&mut items, now);
        items
            .as_slice()
            .iter()
            .filter(|r| !r.hidden(visibility))
            .cloned()
            .collect()
    }

    /// The whole canonical collection, hidden records included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().as_slice().to_vec()
    }

    /// The record with `id`, hidden or not.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<T> {
        self.items.lock().get(id).cloned()
    }

    /// Signature of the current collection.
    #[must_use]
    pub fn signature(&self) -> String {
        self.items.lock().signature()
    }

    /// Registers `handler` for every future change.
    pub fn subscribe(&self, handler: impl Fn(&SyncEvent<T>) + Send + Sync + 'static) -> Subscription {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, Arc::new(handler)));
        let handlers: Weak<Handlers<T>> = Arc::downgrade(&self.handlers);
        Subscription {
            cancel: Box::new(move || {
                if let Some(handlers) = handlers.upgrade() {
                    handlers.lock().retain(|(h, _)| *h != id);
                }
            }),
        }
    }

    fn apply(
        &self,
        items: &mut Collection<T>,
        mut record: T,
        origin: Origin,
        now: DateTime<Utc>,
    ) -> (Applied, T) {
        record.normalize();
        if record.created_at() < self.policy.retention.archive_cutoff(now) {
            return (Applied::Archived, record);
        }
        match items.get(record.id()).map(|existing| *existing == record) {
            Some(true) => return (Applied::Unchanged, record),
            Some(false) if T::IMMUTABLE && origin == Origin::Remote => {
                return (Applied::Unchanged, record);
            }
            Some(false) => {
                items.upsert(record.clone());
                return (Applied::Replaced, record);
            }
            None => {}
        }
        // A peer's optimistic copy that arrives after its remote echo.
        if origin == Origin::Peer && items.is_confirmed_elsewhere(&record, self.policy.dedup_window) {
            return (Applied::Unchanged, record);
        }
        if origin == Origin::Remote
            && let Some(index) = items.find_echo(&record, self.policy.dedup_window)
        {
            let old = items.replace_at(index, record.clone());
            return (
                Applied::Reconciled {
                    local_id: old.id().to_string(),
                },
                record,
            );
        }
        items.upsert(record.clone());
        (Applied::Inserted, record)
    }

    /// Drops archived records, mirroring the drop to the store.
    fn archive(&self, items: &mut Collection<T>, now: DateTime<Utc>) {
        if items.prune(self.policy.retention.archive_cutoff(now)) > 0 {
            self.write_back(items, now);
        }
    }

    fn write_back(&self, items: &Collection<T>, now: DateTime<Utc>) {
        let Some(json) = self.serialize(items) else {
            return;
        };
        if let Err(e) = self.store.write_all(T::KIND, &json) {
            tracing::warn!(kind = %T::KIND, error = %e, "failed to persist collection");
        }
        self.store
            .prune_before(T::KIND, self.policy.retention.archive_cutoff(now));
    }

    fn persist_upsert(&self, items: &Collection<T>, record: &T) {
        let (Some(json), Ok(row)) = (self.serialize(items), record.to_json()) else {
            return;
        };
        if let Err(e) = self.store.persist_upsert(T::KIND, &json, &row) {
            tracing::warn!(kind = %T::KIND, id = record.id(), error = %e, "failed to persist upsert");
        }
    }

    fn persist_delete(&self, items: &Collection<T>, id: &str) {
        let Some(json) = self.serialize(items) else {
            return;
        };
        if let Err(e) = self.store.persist_delete(T::KIND, &json, id) {
            tracing::warn!(kind = %T::KIND, id, error = %e, "failed to persist delete");
        }
    }

    fn serialize(&self, items: &Collection<T>) -> Option<Vec<serde_json::Value>> {
        match items.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!(kind = %T::KIND, error = %e, "failed to serialize collection");
                None
            }
        }
    }

    fn notify(&self, event: &SyncEvent<T>) {
        let handlers: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

impl<T: Record> fmt::Debug for Synchronizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("kind", &T::KIND)
            .field("len", &self.items.lock().len())
            .finish_non_exhaustive()
    }
}
