//! Ordered, id-deduplicated record list.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use super::record::Record;

/// A canonical collection: unique ids, ordered by `createdAt`.
///
/// New records are inserted after any with an equal timestamp, so merge
/// order breaks ties. Replacements keep their slot.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    items: Vec<T>,
}

impl<T: Record> Default for Collection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Record> Collection<T> {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection by upserting `records` in order.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = T>) -> Self {
        let mut collection = Self::new();
        for record in records {
            collection.upsert(record);
        }
        collection
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records in canonical order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Index of the record with `id`.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|r| r.id() == id)
    }

    /// The record with `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|r| r.id() == id)
    }

    /// Inserts `record`, or replaces the record with the same id.
    ///
    /// Returns `true` if an existing record was replaced.
    pub fn upsert(&mut self, record: T) -> bool {
        if let Some(index) = self.position(record.id()) {
            self.items[index] = record;
            return true;
        }
        let index = self.insertion_point(record.created_at());
        self.items.insert(index, record);
        false
    }

    /// Replaces the record at `index` in place with one that may carry a
    /// new id and timestamp.
    ///
    /// Returns the record that was there. Any other record already
    /// holding the new id is dropped so ids stay unique.
    pub fn replace_at(&mut self, index: usize, record: T) -> T {
        let old = std::mem::replace(&mut self.items[index], record);
        let id = self.items[index].id().to_string();
        let mut i = 0;
        self.items.retain(|r| {
            let keep = i == index || r.id() != id;
            i += 1;
            keep
        });
        old
    }

    /// Removes the record with `id`.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let index = self.position(id)?;
        Some(self.items.remove(index))
    }

    /// Drops records created before `cutoff`, returning how many went.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.items.len();
        self.items.retain(|r| r.created_at() >= cutoff);
        before - self.items.len()
    }

    /// Index of the newest unconfirmed record that `incoming` echoes.
    #[must_use]
    pub fn find_echo(&self, incoming: &T, window: TimeDelta) -> Option<usize> {
        let matches = |i: &usize| {
            let candidate = &self.items[*i];
            !candidate.is_confirmed() && incoming.is_echo_of(candidate, window)
        };
        if T::NEWEST_FIRST {
            (0..self.items.len()).find(matches)
        } else {
            (0..self.items.len()).rev().find(matches)
        }
    }

    /// Whether a confirmed record already stands for the unconfirmed `incoming`.
    #[must_use]
    pub fn is_confirmed_elsewhere(&self, incoming: &T, window: TimeDelta) -> bool {
        !incoming.is_confirmed()
            && self
                .items
                .iter()
                .any(|r| r.is_confirmed() && r.is_echo_of(incoming, window))
    }

    /// Cheap digest used to detect change between two observations.
    #[must_use]
    pub fn signature(&self) -> String {
        signature(&self.items)
    }

    /// Canonical JSON of every record.
    ///
    /// # Errors
    ///
    /// Returns an error if a record fails to serialize.
    pub fn to_json(&self) -> Result<Vec<Value>, serde_json::Error> {
        self.items.iter().map(Record::to_json).collect()
    }

    fn insertion_point(&self, created_at: DateTime<Utc>) -> usize {
        if T::NEWEST_FIRST {
            self.items.partition_point(|r| r.created_at() >= created_at)
        } else {
            self.items.partition_point(|r| r.created_at() <= created_at)
        }
    }
}

/// Signature of an arbitrary record sequence, in the given order.
#[must_use]
pub fn signature<T: Record>(records: &[T]) -> String {
    let mut out = String::new();
    for record in records {
        record.signature_fragment(&mut out);
        out.push('\n');
    }
    out
}
