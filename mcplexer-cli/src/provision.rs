//! Convert config file entries into store entities and reconcile them
//!
//! Names in the file resolve to existing row ids where possible so that
//! re-provisioning updates rows in place. Rule ids are derived from the
//! file position, which keeps them stable across restarts.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use mcplexer_auth::Encryptor;
use mcplexer_config::McplexerConfig;
use mcplexer_storage::entities::{
    new_id, AuthScope, DiscoveryMode, DownstreamServer, RoutePolicy, RouteRule, ScopeKind, TransportKind, Workspace,
};
use mcplexer_storage::sync::{sync_yaml, SyncReport, YamlState};
use mcplexer_storage::{Store, StoreError};

/// Apply the config file's provisioned rows to the store
pub async fn provision(
    store: &Arc<dyn Store>,
    encryptor: &Arc<dyn Encryptor>,
    config: &McplexerConfig,
) -> Result<SyncReport> {
    let mut desired = YamlState::default();

    for entry in &config.workspaces {
        let id = match store.get_workspace_by_name(&entry.name).await {
            Ok(existing) => existing.id,
            Err(StoreError::NotFound { .. }) => new_id(),
            Err(e) => return Err(e.into()),
        };
        let policy = RoutePolicy::parse(&entry.default_policy)
            .with_context(|| format!("workspace {:?} default_policy", entry.name))?;
        let mut workspace = Workspace::new(&entry.name, &entry.root, policy);
        workspace.id = id;
        desired.workspaces.push(workspace);
    }

    for entry in &config.servers {
        let id = match store.get_downstream_server_by_name(&entry.name).await {
            Ok(existing) => existing.id,
            Err(StoreError::NotFound { .. }) => new_id(),
            Err(e) => return Err(e.into()),
        };
        let mut server = match entry.transport.as_str() {
            "stdio" => DownstreamServer::stdio(
                &entry.name,
                &entry.namespace,
                entry.command.clone().unwrap_or_default(),
                entry.args.clone(),
            ),
            "http" => DownstreamServer::http(&entry.name, &entry.namespace, entry.url.clone().unwrap_or_default()),
            other => bail!("server {:?} has unsupported transport {other:?}", entry.name),
        };
        server.id = id;
        server.env = entry.env.clone();
        server.discovery = DiscoveryMode::parse(&entry.discovery)
            .with_context(|| format!("server {:?} discovery", entry.name))?;
        server.idle_timeout_sec = entry.idle_timeout_sec;
        server.max_instances = entry.max_instances;
        server.disabled = entry.disabled;
        desired.servers.push(server);
    }

    for entry in &config.scopes {
        let existing = store
            .list_auth_scopes()
            .await?
            .into_iter()
            .find(|scope| scope.name == entry.name);
        let kind = ScopeKind::parse(&entry.scope_type).with_context(|| format!("scope {:?} type", entry.name))?;
        let mut scope = AuthScope::new(&entry.name, kind);
        if let Some(existing) = existing {
            scope.id = existing.id;
        }
        if kind == ScopeKind::Oauth2 {
            let provider_name = entry.provider.as_deref().unwrap_or_default();
            let provider = store
                .get_oauth_provider_by_name(provider_name)
                .await
                .with_context(|| format!("scope {:?} references provider {provider_name:?}", entry.name))?;
            scope.oauth_provider_id = Some(provider.id);
        } else if !entry.values.is_empty() {
            let plaintext = serde_json::to_vec(&entry.values)?;
            scope.encrypted_data = Some(
                encryptor
                    .seal(&plaintext)
                    .map_err(|e| anyhow::anyhow!("sealing scope {:?}: {e}", entry.name))?,
            );
        }
        desired.scopes.push(scope);
    }

    // Rules resolve their references against the rows assembled above.
    for (index, entry) in config.rules.iter().enumerate() {
        let workspace = desired
            .workspaces
            .iter()
            .find(|w| w.name == entry.workspace)
            .with_context(|| format!("rule #{index} references workspace {:?}", entry.workspace))?;

        let downstream_server_id = match &entry.server {
            Some(name) => Some(
                desired
                    .servers
                    .iter()
                    .find(|s| &s.name == name)
                    .with_context(|| format!("rule #{index} references server {name:?}"))?
                    .id
                    .clone(),
            ),
            None => None,
        };
        let auth_scope_id = match &entry.scope {
            Some(name) => Some(
                desired
                    .scopes
                    .iter()
                    .find(|s| &s.name == name)
                    .with_context(|| format!("rule #{index} references scope {name:?}"))?
                    .id
                    .clone(),
            ),
            None => None,
        };

        let policy = RoutePolicy::parse(&entry.policy).with_context(|| format!("rule #{index} policy"))?;
        let mut rule = match policy {
            RoutePolicy::Allow => RouteRule::allow(
                &workspace.id,
                &entry.path,
                downstream_server_id.clone().unwrap_or_default(),
            ),
            RoutePolicy::Deny => RouteRule::deny(&workspace.id, &entry.path),
        };
        // Position-derived id: stable across restarts, unique per file
        rule.id = format!("yaml:{}:{index}", entry.workspace);
        rule.priority = entry.priority;
        rule.tool_match = entry.tools.clone();
        rule.downstream_server_id = downstream_server_id;
        rule.auth_scope_id = auth_scope_id;
        rule.requires_approval = entry.requires_approval;
        rule.approval_timeout_sec = entry.approval_timeout_sec;
        desired.rules.push(rule);
    }

    Ok(sync_yaml(store.as_ref(), desired).await?)
}
