//! Typed entities persisted by the store

pub mod approval;
pub mod audit;
pub mod auth_scope;
pub mod downstream;
pub mod oauth_provider;
pub mod route_rule;
pub mod session;
pub mod workspace;

pub use approval::{ApprovalStatus, ToolApproval};
pub use audit::{AuditAggregate, AuditFilter, AuditRecord, AuditStatus};
pub use auth_scope::{AuthScope, ScopeKind};
pub use downstream::{DiscoveryMode, DownstreamServer, RestartPolicy, TransportKind};
pub use oauth_provider::OAuthProvider;
pub use route_rule::{RoutePolicy, RouteRule};
pub use session::SessionRecord;
pub use workspace::Workspace;

use serde::{Deserialize, Serialize};

/// Where a record originated. YAML-sourced rows are pruned when they
/// disappear from the config file; auto-discovery rows come from OAuth
/// server metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordSource {
    Api,
    Yaml,
    AutoDiscovery,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Yaml => "yaml",
            Self::AutoDiscovery => "auto-discovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(Self::Api),
            "yaml" => Some(Self::Yaml),
            "auto-discovery" => Some(Self::AutoDiscovery),
            _ => None,
        }
    }
}

impl Default for RecordSource {
    fn default() -> Self {
        Self::Api
    }
}

/// Generate a fresh entity id
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
