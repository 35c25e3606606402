//! Downstream MCP server definition

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordSource;

/// Transport used to reach a downstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned child process speaking line-delimited JSON-RPC
    Stdio,
    /// Remote MCP Streamable HTTP endpoint
    Http,
    /// Handlers living in the gateway process itself
    Internal,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdio" => Some(Self::Stdio),
            "http" => Some(Self::Http),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// How the tool catalog for a server is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Catalog comes from the capabilities cache only
    Static,
    /// Catalog is fetched with `tools/list` on demand
    Dynamic,
}

impl DiscoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(Self::Static),
            "dynamic" => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// Restart behavior after an instance dies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Lazy restart on the next call (default)
    OnDemand,
    /// Never restart once stopped; calls fail until re-enabled
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Never => "never",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on-demand" => Some(Self::OnDemand),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnDemand
    }
}

/// A backend MCP server the gateway multiplexes.
///
/// `tool_namespace` is globally unique: aggregated tool names are exposed to
/// clients as `<tool_namespace>__<tool>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamServer {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,

    /// Executable for stdio transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for stdio transport
    #[serde(default)]
    pub args: Vec<String>,

    /// Server-declared environment for stdio children. Values may reference
    /// already-merged variables with `${VAR}`.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Endpoint for http transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Globally unique namespace prefix in the aggregated catalog
    pub tool_namespace: String,

    pub discovery: DiscoveryMode,

    /// Opaque snapshot of the last successful `tools/list` result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities_cache: Option<Vec<u8>>,

    /// Seconds of idleness before a running instance is stopped
    pub idle_timeout_sec: u64,

    /// Upper bound on concurrently running instances for this server
    pub max_instances: u32,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Disabled servers are excluded from discovery and fail `get_or_start`
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub source: RecordSource,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownstreamServer {
    /// Construct a stdio-backed server definition with defaults
    pub fn stdio(
        name: impl Into<String>,
        tool_namespace: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            tool_namespace: tool_namespace.into(),
            discovery: DiscoveryMode::Dynamic,
            capabilities_cache: None,
            idle_timeout_sec: 300,
            max_instances: 4,
            restart_policy: RestartPolicy::OnDemand,
            disabled: false,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }

    /// Construct an http-backed server definition with defaults
    pub fn http(name: impl Into<String>, tool_namespace: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.into(),
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            tool_namespace: tool_namespace.into(),
            discovery: DiscoveryMode::Dynamic,
            capabilities_cache: None,
            idle_timeout_sec: 300,
            max_instances: 4,
            restart_policy: RestartPolicy::OnDemand,
            disabled: false,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }
}
