//! The record abstraction the synchronizer merges.

use std::fmt::Write as _;

use chrono::{DateTime, TimeDelta, Utc};
use opsync_proto::Task;
use serde::Serialize;
use serde_json::Value;

use crate::remote::rows;
use crate::store::RecordKind;

/// A record type kept in a canonical collection.
///
/// Implementations supply identity, ordering, lenient parsing, and the
/// per-type rules (completion normalization for tasks, echo matching for
/// messages). Everything else in the merge path is shared.
pub trait Record: Clone + PartialEq + Send + Sync + Serialize + 'static {
    /// Which store key, table, and peer channel this type uses.
    const KIND: RecordKind;

    /// `true` if the canonical order is newest first.
    const NEWEST_FIRST: bool;

    /// `true` if a confirmed copy is never overwritten by a remote echo.
    const IMMUTABLE: bool = false;

    /// Globally unique id.
    fn id(&self) -> &str;

    /// Creation time; the ordering key.
    fn created_at(&self) -> DateTime<Utc>;

    /// Lenient parse from canonical JSON. `None` means malformed.
    fn from_json(value: &Value, now: DateTime<Utc>) -> Option<Self>;

    /// Lenient parse from a remote row.
    fn from_row(row: &Value, now: DateTime<Utc>) -> Option<Self> {
        Self::from_json(&rows::from_row(Self::KIND, row), now)
    }

    /// Canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error only if serialization itself fails.
    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Appends the fields that the change signature covers.
    fn signature_fragment(&self, out: &mut String);

    /// Repairs invariants on a record from an untrusted transport.
    fn normalize(&mut self) {}

    /// Whether the record is excluded from the rendered view.
    fn hidden(&self, _visibility_cutoff: DateTime<Utc>) -> bool {
        false
    }

    /// `false` while the record is an optimistic copy the remote has not
    /// acknowledged.
    fn is_confirmed(&self) -> bool {
        true
    }

    /// Whether `self`, delivered by the remote, is the confirmed copy of
    /// the unconfirmed `candidate`.
    fn is_echo_of(&self, _candidate: &Self, _window: TimeDelta) -> bool {
        false
    }
}

impl Record for Task {
    const KIND: RecordKind = RecordKind::Tasks;
    const NEWEST_FIRST: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn from_json(value: &Value, now: DateTime<Utc>) -> Option<Self> {
        Self::from_json(value, now)
    }

    fn signature_fragment(&self, out: &mut String) {
        let completed_at = self
            .completed_at
            .as_ref()
            .map(opsync_proto::stamp::format)
            .unwrap_or_default();
        let _ = write!(out, "{}{}{}{completed_at};", self.id, self.completed, self.text);
    }

    fn normalize(&mut self) {
        self.normalize_completion();
    }

    fn hidden(&self, visibility_cutoff: DateTime<Utc>) -> bool {
        self.completed
            && self
                .completed_at
                .is_some_and(|done| done < visibility_cutoff)
    }
}
