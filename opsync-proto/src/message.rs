//! Message stream record.
//!
//! Messages are immutable once created. A message with no `recipient_id`
//! is addressed to the whole group.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stamp;

/// Prefix of ids assigned to messages before the remote store confirms them.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Kind of payload a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment (content holds a reference).
    Image,
    /// File attachment (content holds a reference).
    File,
    /// Voice note (content holds a reference).
    Audio,
}

impl MessageKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`MessageKind`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "audio" => Ok(Self::Audio),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A message in the shared message stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier (`local-` prefixed until the remote confirms it).
    pub id: String,
    /// Body text, or an attachment reference for non-text kinds.
    pub content: String,
    /// Sender identity. `None` when attribution was not representable remotely.
    pub sender_id: Option<String>,
    /// Sender display name.
    pub sender_name: String,
    /// Sender role tag.
    pub sender_role_tag: String,
    /// Direct recipient; `None` means the whole group.
    pub recipient_id: Option<String>,
    /// Payload kind.
    pub kind: MessageKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Read flag. Not touched by the merge engine.
    pub is_read: bool,
}

impl Message {
    /// Creates an optimistic local message with a `local-` id.
    #[must_use]
    pub fn new_local(
        content: impl Into<String>,
        sender_id: Option<String>,
        sender_name: impl Into<String>,
        sender_role_tag: impl Into<String>,
        recipient_id: Option<String>,
        kind: MessageKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7()),
            content: content.into(),
            sender_id,
            sender_name: sender_name.into(),
            sender_role_tag: sender_role_tag.into(),
            recipient_id,
            kind,
            created_at: now,
            is_read: false,
        }
    }

    /// Returns `true` if the message is addressed to the whole group.
    #[must_use]
    pub const fn is_group(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Returns `true` if the id was assigned locally and never confirmed.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// Builds a message from loosely-typed canonical JSON.
    ///
    /// Returns `None` when the id or content is missing or of the wrong
    /// type. Unknown kinds read as [`MessageKind::Text`]; unparsable
    /// timestamps become `now`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value, now: DateTime<Utc>) -> Option<Self> {
        let loose: LooseMessage = serde_json::from_value(value.clone()).ok()?;
        if loose.id.trim().is_empty() {
            return None;
        }
        Some(Self {
            id: loose.id,
            content: loose.content,
            sender_id: loose.sender_id,
            sender_name: loose.sender_name.unwrap_or_default(),
            sender_role_tag: loose.sender_role_tag.unwrap_or_default(),
            recipient_id: loose.recipient_id.filter(|r| !r.is_empty()),
            kind: loose
                .kind
                .as_deref()
                .and_then(|k| k.parse().ok())
                .unwrap_or_default(),
            created_at: stamp::parse_or(loose.created_at.as_deref(), now),
            is_read: loose.is_read.unwrap_or(false),
        })
    }
}

/// Permissive mirror of [`Message`] used when reading untrusted JSON.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LooseMessage {
    id: String,
    content: String,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    sender_role_tag: Option<String>,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    is_read: Option<bool>,
}
