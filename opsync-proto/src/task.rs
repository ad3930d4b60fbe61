//! Shared task record.
//!
//! A [`Task`] is identified by an opaque string id that is unique across
//! every transport. Locally created tasks use UUID v7 ids so they sort by
//! creation time and are accepted verbatim by the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stamp;

/// Routing tag meaning "every role".
pub const ROLE_ALL: &str = "all";

/// A task in the shared task list.
///
/// Serializes as camelCase JSON with RFC 3339 timestamps. That shape is
/// what the blob store and the peer channel carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Globally unique identifier.
    pub id: String,
    /// Free text describing the work.
    pub text: String,
    /// Display label of whoever the task is assigned to.
    pub assignee_label: String,
    /// Coarse routing tag: a role name or [`ROLE_ALL`].
    pub target_role_tag: String,
    /// Whether the task has been completed.
    pub completed: bool,
    /// When the task was completed. Only set while `completed` is true.
    pub completed_at: Option<DateTime<Utc>>,
    /// Who completed the task. Only set while `completed` is true.
    pub completed_by: Option<String>,
    /// Creation time (immutable).
    pub created_at: DateTime<Utc>,
    /// Creator identity (immutable, may be unknown).
    pub created_by: Option<String>,
}

impl Task {
    /// Creates a new open task with a fresh UUID v7 id.
    #[must_use]
    pub fn new(
        text: impl Into<String>,
        assignee_label: impl Into<String>,
        target_role_tag: impl Into<String>,
        created_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            text: text.into(),
            assignee_label: assignee_label.into(),
            target_role_tag: target_role_tag.into(),
            completed: false,
            completed_at: None,
            completed_by: None,
            created_at: now,
            created_by,
        }
    }

    /// Marks the task completed or open.
    ///
    /// Completion time and identity are set together with `completed = true`
    /// and cleared together when the task is reopened.
    pub fn set_completed(&mut self, completed: bool, by: Option<String>, now: DateTime<Utc>) {
        self.completed = completed;
        if completed {
            self.completed_at = Some(now);
            self.completed_by = by;
        } else {
            self.completed_at = None;
            self.completed_by = None;
        }
    }

    /// Clears completion fields on an open task.
    ///
    /// Records from other writers may carry stray `completedAt`/`completedBy`
    /// values on an open task; those are dropped here.
    pub fn normalize_completion(&mut self) {
        if !self.completed {
            self.completed_at = None;
            self.completed_by = None;
        }
    }

    /// Returns `true` if the task is routed to `role` (or to everyone).
    #[must_use]
    pub fn is_for_role(&self, role: &str) -> bool {
        self.target_role_tag == ROLE_ALL || self.target_role_tag == role
    }

    /// Builds a task from loosely-typed canonical JSON.
    ///
    /// Returns `None` if the id or text is missing, empty, or of the wrong
    /// type. Unparsable timestamps become `now`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value, now: DateTime<Utc>) -> Option<Self> {
        let loose: LooseTask = serde_json::from_value(value.clone()).ok()?;
        if loose.id.trim().is_empty() {
            return None;
        }
        let mut task = Self {
            id: loose.id,
            text: loose.text,
            assignee_label: loose.assignee_label.unwrap_or_default(),
            target_role_tag: loose
                .target_role_tag
                .unwrap_or_else(|| ROLE_ALL.to_string()),
            completed: loose.completed.unwrap_or(false),
            completed_at: loose
                .completed_at
                .as_deref()
                .map(|raw| stamp::parse_or(Some(raw), now)),
            completed_by: loose.completed_by,
            created_at: stamp::parse_or(loose.created_at.as_deref(), now),
            created_by: loose.created_by,
        };
        task.normalize_completion();
        Some(task)
    }
}

/// Permissive mirror of [`Task`] used when reading untrusted JSON.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LooseTask {
    id: String,
    text: String,
    #[serde(default)]
    assignee_label: Option<String>,
    #[serde(default)]
    target_role_tag: Option<String>,
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    completed_by: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}
