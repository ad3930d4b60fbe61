//! Translation between canonical records and remote row shape.
//!
//! Canonical records are camelCase (`assigneeLabel`, `createdAt`); rows are
//! snake_case with a few renamed columns (`assigned_to`, `message_type`).
//! This is the only place that knows both spellings. The `SQLite` store
//! reuses it because its columns mirror the row shape.

use chrono::{DateTime, Utc};
use opsync_proto::stamp;
use opsync_proto::{Message, Task};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::remote_identity;
use crate::store::RecordKind;

/// `(canonical, row)` field names for tasks.
const TASK_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("text", "text"),
    ("assigneeLabel", "assigned_to"),
    ("targetRoleTag", "target_role"),
    ("completed", "completed"),
    ("completedAt", "completed_at"),
    ("completedBy", "completed_by"),
    ("createdAt", "created_at"),
    ("createdBy", "created_by"),
];

/// `(canonical, row)` field names for messages.
const MESSAGE_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("content", "content"),
    ("senderId", "sender_id"),
    ("senderName", "sender_name"),
    ("senderRoleTag", "sender_role"),
    ("recipientId", "recipient_id"),
    ("kind", "message_type"),
    ("createdAt", "created_at"),
    ("isRead", "is_read"),
];

/// Row columns holding user identities that the remote validates as UUIDs.
const ATTRIBUTION_COLUMNS: &[&str] = &["created_by", "completed_by", "sender_id"];

const fn fields(kind: RecordKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        RecordKind::Tasks => TASK_FIELDS,
        RecordKind::Messages => MESSAGE_FIELDS,
    }
}

fn rename(value: &Value, pairs: impl Iterator<Item = (&'static str, &'static str)>) -> Value {
    let Some(obj) = value.as_object() else {
        return Value::Object(Map::new());
    };
    let mut out = Map::new();
    for (from, to) in pairs {
        if let Some(v) = obj.get(from) {
            out.insert(to.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

/// Converts a canonical record (or partial patch) to row shape.
///
/// Unknown fields are dropped; fields absent from the input stay absent.
#[must_use]
pub fn to_row(kind: RecordKind, canonical: &Value) -> Value {
    rename(canonical, fields(kind).iter().copied())
}

/// Converts a row (or partial row) to canonical shape.
#[must_use]
pub fn from_row(kind: RecordKind, row: &Value) -> Value {
    rename(row, fields(kind).iter().map(|&(c, r)| (r, c)))
}

/// Converts a canonical record to the row sent to the remote store.
///
/// Attribution columns that are not UUIDs are sent as `null`.
#[must_use]
pub fn for_remote(kind: RecordKind, canonical: &Value) -> Value {
    let mut row = to_row(kind, canonical);
    if let Some(obj) = row.as_object_mut() {
        for column in ATTRIBUTION_COLUMNS {
            if let Some(v) = obj.get_mut(*column) {
                *v = remote_identity(v.as_str()).map_or(Value::Null, Value::String);
            }
        }
    }
    row
}

/// Task row as stored in the `tasks` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    /// Task id.
    pub id: String,
    /// Task text.
    pub text: String,
    /// Assignee label.
    pub assigned_to: String,
    /// Routing tag.
    pub target_role: String,
    /// Completion flag.
    pub completed: bool,
    /// RFC 3339 completion time.
    pub completed_at: Option<String>,
    /// Completer identity.
    pub completed_by: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Creator identity.
    pub created_by: Option<String>,
}

/// Message row as stored in the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Message id.
    pub id: String,
    /// Body or attachment reference.
    pub content: String,
    /// Sender identity.
    pub sender_id: Option<String>,
    /// Sender display name.
    pub sender_name: String,
    /// Sender role tag.
    pub sender_role: String,
    /// Direct recipient, `None` for group.
    pub recipient_id: Option<String>,
    /// Payload kind name.
    pub message_type: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Read flag.
    pub is_read: bool,
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            text: task.text.clone(),
            assigned_to: task.assignee_label.clone(),
            target_role: task.target_role_tag.clone(),
            completed: task.completed,
            completed_at: task.completed_at.as_ref().map(stamp::format),
            completed_by: task.completed_by.clone(),
            created_at: stamp::format(&task.created_at),
            created_by: task.created_by.clone(),
        }
    }
}

impl TaskRow {
    /// Converts back to a canonical task, coercing bad timestamps to `now`.
    #[must_use]
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        let mut task = Task {
            id: self.id,
            text: self.text,
            assignee_label: self.assigned_to,
            target_role_tag: self.target_role,
            completed: self.completed,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|raw| stamp::parse_or(Some(raw), now)),
            completed_by: self.completed_by,
            created_at: stamp::parse_or(Some(&self.created_at), now),
            created_by: self.created_by,
        };
        task.normalize_completion();
        task
    }
}

impl From<&Message> for MessageRow {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            content: msg.content.clone(),
            sender_id: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            sender_role: msg.sender_role_tag.clone(),
            recipient_id: msg.recipient_id.clone(),
            message_type: msg.kind.as_str().to_string(),
            created_at: stamp::format(&msg.created_at),
            is_read: msg.is_read,
        }
    }
}

impl MessageRow {
    /// Converts back to a canonical message. Unknown kinds read as text.
    #[must_use]
    pub fn into_message(self, now: DateTime<Utc>) -> Message {
        Message {
            id: self.id,
            content: self.content,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            sender_role_tag: self.sender_role,
            recipient_id: self.recipient_id.filter(|r| !r.is_empty()),
            kind: self.message_type.parse().unwrap_or_default(),
            created_at: stamp::parse_or(Some(&self.created_at), now),
            is_read: self.is_read,
        }
    }
}
