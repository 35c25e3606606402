//! Audit trail entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final disposition of an audited tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
    Blocked,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// One record per tool call through the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    /// Namespaced tool name as the client sent it
    pub tool_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,

    pub status: AuditStatus,

    /// JSON-RPC error code when status is `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Why the call was blocked (denied rule, no route, approval outcome)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,

    pub latency_ms: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<i64>,

    /// Call parameters with secret-looking values elided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_redacted: Option<Value>,

    /// Whether the routing decision came from the route cache
    #[serde(default)]
    pub cache_hit: bool,

    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(tool_name: impl Into<String>, status: AuditStatus) -> Self {
        Self {
            id: super::new_id(),
            session_id: None,
            workspace_id: None,
            server_id: None,
            tool_name: tool_name.into(),
            matched_rule_id: None,
            status,
            error_code: None,
            error_message: None,
            blocked_reason: None,
            latency_ms: 0,
            response_bytes: None,
            params_redacted: None,
            cache_hit: false,
            created_at: Utc::now(),
        }
    }
}

/// Filter for audit queries; all fields are conjunctive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AuditStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows returned, newest first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// Per-server rollup over the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAggregate {
    pub server_id: Option<String>,
    pub calls: i64,
    pub errors: i64,
    pub blocked: i64,
    pub avg_latency_ms: f64,
}
