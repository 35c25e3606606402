//! The composite store interface consumed by the core
//!
//! Entities reference each other only by id; the routing engine resolves
//! references at compile time. Implementations must return the
//! `NotFound` / `AlreadyExists` / `Conflict` sentinels from
//! [`crate::error::StoreError`] so callers can branch on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::entities::{
    ApprovalStatus, AuditAggregate, AuditFilter, AuditRecord, AuthScope, DownstreamServer, OAuthProvider, RouteRule,
    SessionRecord, ToolApproval, Workspace,
};
use crate::error::StoreResult;

/// Closure run inside a transaction by [`Store::tx`]. Store calls made
/// through the handle join the transaction.
pub type TxFn = Box<dyn for<'a> FnOnce(&'a dyn Store) -> BoxFuture<'a, StoreResult<()>> + Send>;

/// Composite persistence contract for the gateway core
#[async_trait]
pub trait Store: Send + Sync {
    // ---- workspaces ----

    async fn create_workspace(&self, workspace: &Workspace) -> StoreResult<()>;
    async fn get_workspace(&self, id: &str) -> StoreResult<Workspace>;
    async fn get_workspace_by_name(&self, name: &str) -> StoreResult<Workspace>;
    async fn list_workspaces(&self) -> StoreResult<Vec<Workspace>>;
    async fn update_workspace(&self, workspace: &Workspace) -> StoreResult<()>;
    async fn delete_workspace(&self, id: &str) -> StoreResult<()>;

    // ---- auth scopes ----

    async fn create_auth_scope(&self, scope: &AuthScope) -> StoreResult<()>;
    async fn get_auth_scope(&self, id: &str) -> StoreResult<AuthScope>;
    async fn list_auth_scopes(&self) -> StoreResult<Vec<AuthScope>>;
    async fn update_auth_scope(&self, scope: &AuthScope) -> StoreResult<()>;
    async fn delete_auth_scope(&self, id: &str) -> StoreResult<()>;

    /// Replace the encrypted OAuth token bundle on a scope
    async fn update_auth_scope_token_data(&self, id: &str, token_data: Option<&[u8]>) -> StoreResult<()>;

    // ---- oauth providers ----

    async fn create_oauth_provider(&self, provider: &OAuthProvider) -> StoreResult<()>;
    async fn get_oauth_provider(&self, id: &str) -> StoreResult<OAuthProvider>;
    async fn get_oauth_provider_by_name(&self, name: &str) -> StoreResult<OAuthProvider>;
    async fn list_oauth_providers(&self) -> StoreResult<Vec<OAuthProvider>>;
    async fn update_oauth_provider(&self, provider: &OAuthProvider) -> StoreResult<()>;
    async fn delete_oauth_provider(&self, id: &str) -> StoreResult<()>;

    // ---- downstream servers ----

    async fn create_downstream_server(&self, server: &DownstreamServer) -> StoreResult<()>;
    async fn get_downstream_server(&self, id: &str) -> StoreResult<DownstreamServer>;
    async fn get_downstream_server_by_name(&self, name: &str) -> StoreResult<DownstreamServer>;
    async fn list_downstream_servers(&self) -> StoreResult<Vec<DownstreamServer>>;
    async fn update_downstream_server(&self, server: &DownstreamServer) -> StoreResult<()>;

    /// Cascade-deletes the server's route rules and cancels its pending
    /// approvals in the same transaction.
    async fn delete_downstream_server(&self, id: &str) -> StoreResult<()>;

    /// Persist a `tools/list` snapshot for discovery fallback
    async fn update_capabilities_cache(&self, id: &str, snapshot: &[u8]) -> StoreResult<()>;

    // ---- route rules ----

    async fn create_route_rule(&self, rule: &RouteRule) -> StoreResult<()>;
    async fn get_route_rule(&self, id: &str) -> StoreResult<RouteRule>;
    async fn list_route_rules(&self) -> StoreResult<Vec<RouteRule>>;
    async fn list_route_rules_for_workspace(&self, workspace_id: &str) -> StoreResult<Vec<RouteRule>>;
    async fn update_route_rule(&self, rule: &RouteRule) -> StoreResult<()>;
    async fn delete_route_rule(&self, id: &str) -> StoreResult<()>;

    // ---- sessions ----

    async fn create_session(&self, session: &SessionRecord) -> StoreResult<()>;
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord>;
    async fn update_session(&self, session: &SessionRecord) -> StoreResult<()>;

    /// Mark a session disconnected at `at`
    async fn close_session(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Close sessions that connected before `before` and never disconnected.
    /// Returns the number of rows swept.
    async fn cleanup_stale_sessions(&self, before: DateTime<Utc>) -> StoreResult<u64>;

    // ---- audit ----

    async fn insert_audit(&self, record: &AuditRecord) -> StoreResult<()>;
    async fn query_audit(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>>;
    async fn audit_aggregates(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditAggregate>>;

    // ---- tool approvals ----

    async fn create_tool_approval(&self, approval: &ToolApproval) -> StoreResult<()>;
    async fn get_tool_approval(&self, id: &str) -> StoreResult<ToolApproval>;
    async fn list_pending_approvals(&self) -> StoreResult<Vec<ToolApproval>>;

    /// Transition a pending approval to a terminal status. Returns
    /// `Conflict` if the approval was already resolved.
    async fn resolve_tool_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolved_by: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ToolApproval>;

    /// Mark pendings created before `before` as `timeout`; returns their ids
    async fn expire_pending_approvals(&self, before: DateTime<Utc>) -> StoreResult<Vec<String>>;

    // ---- transactions ----

    /// Run `f` inside one transaction; rolls back when `f` errors
    async fn tx(&self, f: TxFn) -> StoreResult<()>;
}
