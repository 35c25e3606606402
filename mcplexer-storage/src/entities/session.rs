//! Client session entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One client connection to the gateway.
///
/// `disconnected_at` stays `None` while the session is live; stale sessions
/// (crashed clients) are swept by `cleanup_stale_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,

    /// Client self-identification from `initialize` (e.g. "claude-desktop")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_pid: Option<i64>,

    pub connected_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,

    /// Workspace the session resolved to, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self {
            id: super::new_id(),
            client_type: None,
            client_pid: None,
            connected_at: Utc::now(),
            disconnected_at: None,
            workspace_id: None,
            model_hint: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.disconnected_at.is_none()
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}
