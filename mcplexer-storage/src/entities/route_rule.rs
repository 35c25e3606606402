//! Route rule entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordSource;

/// Allow or deny a matched call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePolicy {
    Allow,
    Deny,
}

impl RoutePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// The unit of routing policy.
///
/// An allow rule must reference a downstream server; a deny rule need not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    pub id: String,

    /// Larger wins, but only within the same specificity class
    pub priority: i64,

    pub workspace_id: String,

    /// Segment glob matched against the call's workspace-relative subpath
    pub path_glob: String,

    /// Tool-name patterns; empty means match every tool
    #[serde(default)]
    pub tool_match: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_scope_id: Option<String>,

    pub policy: RoutePolicy,

    #[serde(default)]
    pub requires_approval: bool,

    /// Seconds to wait for a human decision when approval is required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_sec: Option<u64>,

    #[serde(default)]
    pub source: RecordSource,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RouteRule {
    /// Construct an allow rule with a fresh id
    pub fn allow(
        workspace_id: impl Into<String>,
        path_glob: impl Into<String>,
        downstream_server_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            priority: 0,
            workspace_id: workspace_id.into(),
            path_glob: path_glob.into(),
            tool_match: Vec::new(),
            downstream_server_id: Some(downstream_server_id.into()),
            auth_scope_id: None,
            policy: RoutePolicy::Allow,
            requires_approval: false,
            approval_timeout_sec: None,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }

    /// Construct a deny rule with a fresh id
    pub fn deny(workspace_id: impl Into<String>, path_glob: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            priority: 0,
            workspace_id: workspace_id.into(),
            path_glob: path_glob.into(),
            tool_match: Vec::new(),
            downstream_server_id: None,
            auth_scope_id: None,
            policy: RoutePolicy::Deny,
            requires_approval: false,
            approval_timeout_sec: None,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }

    /// An allow rule must name a downstream server
    pub fn validate(&self) -> Result<(), String> {
        if self.policy == RoutePolicy::Allow && self.downstream_server_id.is_none() {
            return Err("allow rule requires a downstream server".to_string());
        }
        if self.path_glob.is_empty() {
            return Err("path_glob must not be empty".to_string());
        }
        Ok(())
    }
}
