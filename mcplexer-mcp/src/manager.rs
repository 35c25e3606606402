//! Keyed pool of downstream instances
//!
//! `get_or_start` is the only creation path. The pool map has one mutex;
//! starting happens under a per-key lock so a slow handshake never blocks
//! unrelated keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use mcplexer_storage::entities::{DiscoveryMode, DownstreamServer, RestartPolicy, TransportKind};
use mcplexer_storage::Store;

use crate::error::{McpError, McpResult};
use crate::instance::{
    http::HttpInstance, stdio::StdioInstance, DownstreamInstance, HeaderOverlay, InstanceKey, InstanceState,
};
use crate::protocol::{messages::methods, ToolsListResult};

/// Bridges routing decisions to downstream authentication. Implemented by
/// the credential injector; the pool only sees the finished maps.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Environment for a stdio child: OS env, server-declared env, then
    /// auth-derived env, later maps winning.
    async fn env_for_scope(&self, scope_id: &str, server: &DownstreamServer) -> McpResult<HashMap<String, String>>;

    /// Credential headers for an HTTP call. Empty scope id yields an empty
    /// map.
    async fn headers_for_scope(&self, scope_id: &str) -> McpResult<HeaderOverlay>;
}

/// Snapshot of one pool entry for diagnostics
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub key: InstanceKey,
    pub state: InstanceState,
}

/// Owns every running downstream instance, keyed by `(server, auth scope)`
pub struct DownstreamManager {
    store: Arc<dyn Store>,
    credentials: Arc<dyn CredentialResolver>,
    instances: Mutex<HashMap<InstanceKey, Arc<dyn DownstreamInstance>>>,
    start_locks: Mutex<HashMap<InstanceKey, Arc<Mutex<()>>>>,
}

impl DownstreamManager {
    pub fn new(store: Arc<dyn Store>, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            store,
            credentials,
            instances: Mutex::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Forward one `tools/call` to the downstream selected by routing
    pub async fn call(&self, server_id: &str, auth_scope_id: &str, tool_name: &str, args: Value) -> McpResult<Value> {
        let instance = self.get_or_start(server_id, auth_scope_id).await?;
        let headers = self.request_headers(server_id, auth_scope_id).await?;
        let params = json!({ "name": tool_name, "arguments": args });
        instance
            .request(methods::TOOLS_CALL, Some(params), headers.as_ref())
            .await
    }

    /// Raw `tools/list` from one downstream
    pub async fn list_tools(&self, server_id: &str, auth_scope_id: &str) -> McpResult<Value> {
        let instance = self.get_or_start(server_id, auth_scope_id).await?;
        let headers = self.request_headers(server_id, auth_scope_id).await?;
        instance.request(methods::TOOLS_LIST, None, headers.as_ref()).await
    }

    /// Discover tool catalogs for every enabled downstream, in parallel.
    /// Per-server failures are logged and fall back to the capabilities
    /// cache when one exists; they never abort the aggregate.
    pub async fn list_all_tools(self: &Arc<Self>) -> McpResult<HashMap<String, ToolsListResult>> {
        let servers = self.store.list_downstream_servers().await?;
        let mut results = HashMap::new();
        let mut dynamic = Vec::new();

        for server in servers {
            if server.disabled || server.transport == TransportKind::Internal {
                continue;
            }
            if server.discovery == DiscoveryMode::Static {
                // Static servers are never contacted for discovery
                if let Some(tools) = cached_tools(&server) {
                    results.insert(server.id.clone(), tools);
                } else {
                    warn!(server = %server.name, "static server has no capabilities cache");
                }
            } else {
                dynamic.push(server.id.clone());
            }
        }

        results.extend(self.list_tools_for_servers(&dynamic).await?);
        Ok(results)
    }

    /// Discovery fan-out over an explicit server set
    pub async fn list_tools_for_servers(
        self: &Arc<Self>,
        server_ids: &[String],
    ) -> McpResult<HashMap<String, ToolsListResult>> {
        let mut tasks: JoinSet<(String, McpResult<Value>)> = JoinSet::new();
        for server_id in server_ids {
            let manager = self.clone();
            let server_id = server_id.clone();
            tasks.spawn(async move {
                let result = manager.list_tools(&server_id, "").await;
                (server_id, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((server_id, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(raw) => match serde_json::from_value::<ToolsListResult>(raw.clone()) {
                    Ok(tools) => {
                        if let Ok(snapshot) = serde_json::to_vec(&raw) {
                            if let Err(e) = self.store.update_capabilities_cache(&server_id, &snapshot).await {
                                warn!(server_id, error = %e, "failed to persist capabilities cache");
                            }
                        }
                        results.insert(server_id, tools);
                    }
                    Err(e) => warn!(server_id, error = %e, "malformed tools/list result"),
                },
                Err(e) => {
                    warn!(server_id, error = %e, "discovery failed, trying capabilities cache");
                    if let Ok(server) = self.store.get_downstream_server(&server_id).await {
                        if let Some(tools) = cached_tools(&server) {
                            results.insert(server_id, tools);
                        }
                    }
                }
            }
        }
        Ok(results)
    }

    async fn request_headers(&self, server_id: &str, auth_scope_id: &str) -> McpResult<Option<HeaderOverlay>> {
        let server = self.store.get_downstream_server(server_id).await?;
        if server.transport != TransportKind::Http {
            return Ok(None);
        }
        Ok(Some(self.credentials.headers_for_scope(auth_scope_id).await?))
    }

    /// Sole creation path for instances
    pub async fn get_or_start(&self, server_id: &str, auth_scope_id: &str) -> McpResult<Arc<dyn DownstreamInstance>> {
        let key = InstanceKey::new(server_id, auth_scope_id);

        // Per-key start lock so one slow handshake cannot serialize the pool
        let key_lock = {
            let mut locks = self.start_locks.lock().await;
            locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _start_guard = key_lock.lock().await;

        let mut died_previously = false;
        if let Some(existing) = self.instances.lock().await.get(&key) {
            if existing.state() != InstanceState::Stopped {
                return Ok(existing.clone());
            }
            died_previously = true;
        }

        let server = self.store.get_downstream_server(server_id).await?;
        if died_previously && server.restart_policy == RestartPolicy::Never {
            return Err(McpError::configuration(format!(
                "downstream server '{}' stopped and its restart policy is 'never'",
                server.name
            )));
        }
        if server.disabled {
            return Err(McpError::configuration(format!(
                "downstream server '{}' is disabled",
                server.name
            )));
        }

        let running = self
            .instances
            .lock()
            .await
            .iter()
            .filter(|(k, v)| k.server_id == key.server_id && v.state() != InstanceState::Stopped)
            .count();
        if running as u32 >= server.max_instances {
            return Err(McpError::configuration(format!(
                "downstream server '{}' is at its instance limit ({})",
                server.name, server.max_instances
            )));
        }

        let instance: Arc<dyn DownstreamInstance> = match server.transport {
            TransportKind::Stdio => {
                let command = server.command.clone().ok_or_else(|| {
                    McpError::configuration(format!("stdio server '{}' has no command", server.name))
                })?;
                let env = self.credentials.env_for_scope(auth_scope_id, &server).await?;
                Arc::new(StdioInstance::new(
                    key.clone(),
                    command,
                    server.args.clone(),
                    env,
                    Duration::from_secs(server.idle_timeout_sec),
                ))
            }
            TransportKind::Http => {
                let url = server
                    .url
                    .clone()
                    .ok_or_else(|| McpError::configuration(format!("http server '{}' has no url", server.name)))?;
                let headers = self.credentials.headers_for_scope(auth_scope_id).await?;
                Arc::new(HttpInstance::new(
                    key.clone(),
                    url,
                    headers,
                    Duration::from_secs(server.idle_timeout_sec),
                ))
            }
            TransportKind::Internal => {
                return Err(McpError::configuration(format!(
                    "server '{}' is internal; its tools are handled in-process",
                    server.name
                )));
            }
        };

        instance.start().await?;
        self.instances.lock().await.insert(key.clone(), instance.clone());
        debug!(instance = %key, "instance started and pooled");
        Ok(instance)
    }

    /// Diagnostics snapshot of the pool
    pub async fn instance_infos(&self) -> Vec<InstanceInfo> {
        self.instances
            .lock()
            .await
            .values()
            .map(|i| InstanceInfo {
                key: i.key().clone(),
                state: i.state(),
            })
            .collect()
    }

    /// Stop everything and clear the pool. Children are dead when this
    /// returns (each stop bounds its wait at 5 s).
    pub async fn shutdown(&self) {
        let snapshot: Vec<Arc<dyn DownstreamInstance>> = {
            let mut instances = self.instances.lock().await;
            instances.drain().map(|(_, v)| v).collect()
        };
        for instance in snapshot {
            if let Err(e) = instance.stop().await {
                warn!(instance = %instance.key(), error = %e, "stop failed during shutdown");
            }
        }
        info!("downstream manager shut down");
    }
}

/// Decode a server's persisted `tools/list` snapshot
fn cached_tools(server: &DownstreamServer) -> Option<ToolsListResult> {
    let snapshot = server.capabilities_cache.as_deref()?;
    match serde_json::from_slice(snapshot) {
        Ok(tools) => Some(tools),
        Err(e) => {
            warn!(server = %server.name, error = %e, "capabilities cache is malformed");
            None
        }
    }
}
