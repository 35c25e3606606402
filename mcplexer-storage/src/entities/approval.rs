//! Tool approval entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A pending or resolved human approval for one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApproval {
    pub id: String,
    pub status: ApprovalStatus,

    /// Namespaced tool name the call targeted
    pub tool_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    /// Downstream server the matched rule routed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,

    /// Short human-readable summary of the call parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ToolApproval {
    pub fn pending(tool_name: impl Into<String>) -> Self {
        Self {
            id: super::new_id(),
            status: ApprovalStatus::Pending,
            tool_name: tool_name.into(),
            workspace_id: None,
            server_id: None,
            model_hint: None,
            params_summary: None,
            resolved_by: None,
            resolve_reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}
