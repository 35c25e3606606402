//! Reconcile YAML-declared rows with the store
//!
//! Rows provisioned from the config file are tagged `source=yaml`. On each
//! startup the desired state is upserted by name and yaml-sourced rows that
//! no longer appear in the file are pruned. API-sourced rows are never
//! touched. Upserts run in dependency order (workspaces, scopes, servers,
//! rules) and prunes in reverse, so references never dangle mid-sync.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::entities::{AuthScope, DownstreamServer, RecordSource, RouteRule, Workspace};
use crate::error::{StoreError, StoreResult};
use crate::store::Store;

/// Desired yaml-sourced state, already converted to entities
#[derive(Debug, Default)]
pub struct YamlState {
    pub workspaces: Vec<Workspace>,
    pub servers: Vec<DownstreamServer>,
    pub scopes: Vec<AuthScope>,
    pub rules: Vec<RouteRule>,
}

/// What a sync pass changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub pruned: usize,
}

/// Apply `desired` to the store.
///
/// Workspaces, servers, and scopes match by unique name; rules match by
/// id, which the provisioner derives deterministically from the file
/// position. Existing ids are preserved on update so rules keep pointing
/// at the same rows.
pub async fn sync_yaml(store: &dyn Store, mut desired: YamlState) -> StoreResult<SyncReport> {
    let mut report = SyncReport::default();

    let mut keep_workspaces = HashSet::new();
    for workspace in &mut desired.workspaces {
        workspace.source = RecordSource::Yaml;
        match store.get_workspace_by_name(&workspace.name).await {
            Ok(existing) => {
                workspace.id = existing.id;
                store.update_workspace(workspace).await?;
                report.updated += 1;
            }
            Err(StoreError::NotFound { .. }) => {
                store.create_workspace(workspace).await?;
                report.created += 1;
            }
            Err(e) => return Err(e),
        }
        keep_workspaces.insert(workspace.id.clone());
    }

    let mut keep_scopes = HashSet::new();
    for scope in &mut desired.scopes {
        scope.source = RecordSource::Yaml;
        let existing = store
            .list_auth_scopes()
            .await?
            .into_iter()
            .find(|s| s.name == scope.name);
        match existing {
            Some(existing) => {
                scope.id = existing.id;
                // Token data is runtime state; never overwrite it from yaml.
                scope.oauth_token_data = existing.oauth_token_data;
                store.update_auth_scope(scope).await?;
                report.updated += 1;
            }
            None => {
                store.create_auth_scope(scope).await?;
                report.created += 1;
            }
        }
        keep_scopes.insert(scope.id.clone());
    }

    let mut keep_servers = HashSet::new();
    for server in &mut desired.servers {
        server.source = RecordSource::Yaml;
        match store.get_downstream_server_by_name(&server.name).await {
            Ok(existing) => {
                server.id = existing.id;
                server.capabilities_cache = existing.capabilities_cache;
                store.update_downstream_server(server).await?;
                report.updated += 1;
            }
            Err(StoreError::NotFound { .. }) => {
                store.create_downstream_server(server).await?;
                report.created += 1;
            }
            Err(e) => return Err(e),
        }
        keep_servers.insert(server.id.clone());
    }

    let mut keep_rules = HashSet::new();
    for rule in &mut desired.rules {
        rule.source = RecordSource::Yaml;
        match store.get_route_rule(&rule.id).await {
            Ok(_) => {
                store.update_route_rule(rule).await?;
                report.updated += 1;
            }
            Err(StoreError::NotFound { .. }) => {
                store.create_route_rule(rule).await?;
                report.created += 1;
            }
            Err(e) => return Err(e),
        }
        keep_rules.insert(rule.id.clone());
    }

    // Prune in reverse dependency order: rules first, workspaces last.
    for existing in store.list_route_rules().await? {
        if existing.source == RecordSource::Yaml && !keep_rules.contains(&existing.id) {
            debug!(rule = %existing.id, "pruning stale yaml rule");
            store.delete_route_rule(&existing.id).await?;
            report.pruned += 1;
        }
    }
    for existing in store.list_downstream_servers().await? {
        if existing.source == RecordSource::Yaml && !keep_servers.contains(&existing.id) {
            debug!(server = %existing.name, "pruning stale yaml server");
            store.delete_downstream_server(&existing.id).await?;
            report.pruned += 1;
        }
    }
    for existing in store.list_auth_scopes().await? {
        if existing.source == RecordSource::Yaml && !keep_scopes.contains(&existing.id) {
            store.delete_auth_scope(&existing.id).await?;
            report.pruned += 1;
        }
    }
    for existing in store.list_workspaces().await? {
        if existing.source == RecordSource::Yaml && !keep_workspaces.contains(&existing.id) {
            debug!(workspace = %existing.name, "pruning stale yaml workspace");
            store.delete_workspace(&existing.id).await?;
            report.pruned += 1;
        }
    }

    info!(
        created = report.created,
        updated = report.updated,
        pruned = report.pruned,
        "yaml config sync complete"
    );
    Ok(report)
}
