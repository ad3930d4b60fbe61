//! Message records and optimistic-send reconciliation.
//!
//! A message sent from this process is shown at once under a `local-` id.
//! The remote store assigns its own id, so when the confirmed copy comes
//! back it is matched to the optimistic one by sender, recipient, content,
//! and a small time window, and replaces it.

use std::fmt::Write as _;

use chrono::{DateTime, TimeDelta, Utc};
use opsync_proto::{Message, stamp};
use serde_json::Value;

use super::record::Record;
use crate::identity::remote_identity;
use crate::store::RecordKind;

impl Record for Message {
    const KIND: RecordKind = RecordKind::Messages;
    const NEWEST_FIRST: bool = false;
    const IMMUTABLE: bool = true;

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
        let _ = write!(out, "{}{};", self.id, stamp::format(&self.created_at));
    }

    fn is_confirmed(&self) -> bool {
        !self.is_local()
    }

    fn is_echo_of(&self, candidate: &Self, window: TimeDelta) -> bool {
        // The remote may have nulled a non-UUID sender, so compare the
        // coerced form on both sides.
        remote_identity(self.sender_id.as_deref()) == remote_identity(candidate.sender_id.as_deref())
            && self.recipient_id == candidate.recipient_id
            && self.content == candidate.content
            && (self.created_at - candidate.created_at).abs() <= window
    }
}
