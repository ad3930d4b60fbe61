//! Acting-user identity and attribution coercion.
//!
//! The remote store only accepts UUID identities in its attribution
//! columns. Anything else is sent as `null` instead of failing the write.

use uuid::Uuid;

/// The user on whose behalf this process acts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user identifier. Usually a UUID, but any string is accepted locally.
    pub user_id: String,
    /// Name shown next to messages.
    pub display_name: String,
    /// Role tag used for task routing.
    pub role: String,
}

impl Identity {
    /// Creates an identity.
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role: role.into(),
        }
    }

    /// Returns the user id as the remote store would record it.
    #[must_use]
    pub fn remote_user_id(&self) -> Option<String> {
        remote_identity(Some(&self.user_id))
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new("anonymous", "Anonymous", opsync_proto::task::ROLE_ALL)
    }
}

/// Coerces an identity to the form accepted by the remote store.
///
/// Returns the trimmed value if it parses as a UUID, otherwise `None`.
#[must_use]
pub fn remote_identity(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    Uuid::parse_str(raw).ok().map(|_| raw.to_string())
}
