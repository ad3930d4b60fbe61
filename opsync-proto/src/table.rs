//! In-memory row table with the remote store's write semantics.
//!
//! Shared by the relay server and by in-process test doubles so both
//! assign ids, stamp `created_at`, and merge patches the same way.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::stamp;

/// Why a row operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    /// The row or patch is not a JSON object.
    #[error("row must be a JSON object")]
    NotAnObject,
    /// No row has the given id.
    #[error("no row with id {0}")]
    NotFound(String),
}

/// Rows of one table keyed by `id`.
#[derive(Debug, Clone, Default)]
pub struct RowTable {
    rows: BTreeMap<String, Map<String, Value>>,
}

impl RowTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The row with `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Value> {
        self.rows.get(id).cloned().map(Value::Object)
    }

    /// Inserts or replaces a row.
    ///
    /// A missing or empty `id` gets a fresh UUID v4; a missing
    /// `created_at` is stamped with `now`. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`RowError::NotAnObject`] if `row` is not an object.
    pub fn insert(&mut self, row: Value, now: DateTime<Utc>) -> Result<Value, RowError> {
        let Value::Object(mut row) = row else {
            return Err(RowError::NotAnObject);
        };
        let id = match row.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = Uuid::new_v4().to_string();
                row.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        if !row.get("created_at").is_some_and(Value::is_string) {
            row.insert("created_at".into(), Value::String(stamp::format(&now)));
        }
        self.rows.insert(id, row.clone());
        Ok(Value::Object(row))
    }

    /// Merges `patch` into the row with `id`. `id` itself cannot change.
    ///
    /// # Errors
    ///
    /// Returns [`RowError::NotFound`] for an absent row and
    /// [`RowError::NotAnObject`] for a non-object patch.
    pub fn update(&mut self, id: &str, patch: Value) -> Result<Value, RowError> {
        let Value::Object(patch) = patch else {
            return Err(RowError::NotAnObject);
        };
        let row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| RowError::NotFound(id.to_string()))?;
        for (key, value) in patch {
            if key != "id" {
                row.insert(key, value);
            }
        }
        Ok(Value::Object(row.clone()))
    }

    /// Deletes the row with `id`, returning whether it existed.
    pub fn delete(&mut self, id: &str) -> bool {
        self.rows.remove(id).is_some()
    }

    /// Up to `limit` rows created at or after `since`, newest first.
    ///
    /// Rows with an unparsable `created_at` are always included.
    #[must_use]
    pub fn fetch_since(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<Value> {
        let mut rows: Vec<(Option<DateTime<Utc>>, &Map<String, Value>)> = self
            .rows
            .values()
            .map(|row| {
                let created = row
                    .get("created_at")
                    .and_then(Value::as_str)
                    .and_then(stamp::parse);
                (created, row)
            })
            .filter(|(created, _)| match (since, created) {
                (Some(since), Some(created)) => *created >= since,
                _ => true,
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter()
            .take(limit)
            .map(|(_, row)| Value::Object(row.clone()))
            .collect()
    }
}
