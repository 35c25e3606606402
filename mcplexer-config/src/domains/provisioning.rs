//! YAML-provisioned rows: servers, workspaces, scopes, and rules
//!
//! These entries are upserted into the store with `source=yaml` at startup;
//! entries removed from the file are pruned on the next startup.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::validation::{validate_enum_choice, validate_http_url, validate_non_empty, Validatable};

/// One downstream server declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,

    /// Unique namespace prefix in the aggregated tool catalog
    pub namespace: String,

    /// "stdio" or "http"
    pub transport: String,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Server-declared environment; values may use `${VAR}`
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub url: Option<String>,

    /// "dynamic" (default) or "static"
    #[serde(default = "default_discovery")]
    pub discovery: String,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,

    #[serde(default = "default_max_instances")]
    pub max_instances: u32,

    #[serde(default)]
    pub disabled: bool,
}

impl Validatable for ServerEntry {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_non_empty(&self.name, "name", domain)?;
        validate_non_empty(&self.namespace, "namespace", domain)?;
        validate_enum_choice(&self.transport, &["stdio", "http"], "transport", domain)?;
        validate_enum_choice(&self.discovery, &["static", "dynamic"], "discovery", domain)?;
        if self.namespace.contains("__") {
            return Err(ConfigError::domain(
                domain,
                format!("namespace {:?} must not contain '__'", self.namespace),
            ));
        }
        match self.transport.as_str() {
            "stdio" => {
                if self.command.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(ConfigError::domain(
                        domain,
                        format!("stdio server {:?} needs a command", self.name),
                    ));
                }
            }
            "http" => match &self.url {
                Some(url) => validate_http_url(url, "url", domain)?,
                None => {
                    return Err(ConfigError::domain(
                        domain,
                        format!("http server {:?} needs a url", self.name),
                    ))
                }
            },
            _ => unreachable!("transport validated above"),
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "servers"
    }
}

/// One workspace declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub name: String,

    /// Absolute filesystem root
    pub root: String,

    /// "allow" or "deny"
    #[serde(default = "default_policy")]
    pub default_policy: String,
}

impl Validatable for WorkspaceEntry {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_non_empty(&self.name, "name", domain)?;
        validate_non_empty(&self.root, "root", domain)?;
        validate_enum_choice(&self.default_policy, &["allow", "deny"], "default_policy", domain)
    }

    fn domain_name(&self) -> &'static str {
        "workspaces"
    }
}

/// One auth scope declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub name: String,

    /// "env", "header", or "oauth2"
    #[serde(rename = "type")]
    pub scope_type: String,

    /// Plaintext key/value pairs for env/header scopes; sealed before they
    /// reach the store
    #[serde(default)]
    pub values: HashMap<String, String>,

    /// Provider name for oauth2 scopes
    #[serde(default)]
    pub provider: Option<String>,
}

impl Validatable for ScopeEntry {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_non_empty(&self.name, "name", domain)?;
        validate_enum_choice(&self.scope_type, &["env", "header", "oauth2"], "type", domain)?;
        if self.scope_type == "oauth2" && self.provider.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::domain(
                domain,
                format!("oauth2 scope {:?} needs a provider", self.name),
            ));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "scopes"
    }
}

/// One route rule declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Workspace name this rule belongs to
    pub workspace: String,

    #[serde(default = "default_path_glob")]
    pub path: String,

    /// Tool patterns; empty matches every tool
    #[serde(default)]
    pub tools: Vec<String>,

    /// Downstream server name; required for allow rules
    #[serde(default)]
    pub server: Option<String>,

    /// Auth scope name
    #[serde(default)]
    pub scope: Option<String>,

    /// "allow" or "deny"
    #[serde(default = "default_policy_allow")]
    pub policy: String,

    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub requires_approval: bool,

    #[serde(default)]
    pub approval_timeout_sec: Option<u64>,
}

impl Validatable for RuleEntry {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_non_empty(&self.workspace, "workspace", domain)?;
        validate_non_empty(&self.path, "path", domain)?;
        validate_enum_choice(&self.policy, &["allow", "deny"], "policy", domain)?;
        if self.policy == "allow" && self.server.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::domain(domain, "allow rule needs a server".to_string()));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "rules"
    }
}

/// Cross-entry checks: unique names/namespaces and resolvable references
pub fn validate_references(config: &super::McplexerConfig) -> ConfigResult<()> {
    let mut namespaces = HashSet::new();
    let mut server_names = HashSet::new();
    for server in &config.servers {
        if !server_names.insert(server.name.as_str()) {
            return Err(ConfigError::domain(
                "servers",
                format!("duplicate server name {:?}", server.name),
            ));
        }
        if !namespaces.insert(server.namespace.as_str()) {
            return Err(ConfigError::domain(
                "servers",
                format!("duplicate namespace {:?}", server.namespace),
            ));
        }
    }

    let workspace_names: HashSet<&str> = config.workspaces.iter().map(|w| w.name.as_str()).collect();
    if workspace_names.len() != config.workspaces.len() {
        return Err(ConfigError::domain("workspaces", "duplicate workspace name".to_string()));
    }

    let scope_names: HashSet<&str> = config.scopes.iter().map(|s| s.name.as_str()).collect();

    for rule in &config.rules {
        if !workspace_names.contains(rule.workspace.as_str()) {
            return Err(ConfigError::domain(
                "rules",
                format!("rule references unknown workspace {:?}", rule.workspace),
            ));
        }
        if let Some(server) = &rule.server {
            if !server_names.contains(server.as_str()) {
                return Err(ConfigError::domain(
                    "rules",
                    format!("rule references unknown server {server:?}"),
                ));
            }
        }
        if let Some(scope) = &rule.scope {
            if !scope_names.contains(scope.as_str()) {
                return Err(ConfigError::domain(
                    "rules",
                    format!("rule references unknown scope {scope:?}"),
                ));
            }
        }
    }
    Ok(())
}

fn default_discovery() -> String {
    "dynamic".to_string()
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_max_instances() -> u32 {
    4
}

fn default_policy() -> String {
    "deny".to_string()
}

fn default_policy_allow() -> String {
    "allow".to_string()
}

fn default_path_glob() -> String {
    "**".to_string()
}
