//! SQLite-backed store
//!
//! Writes serialize through a single-connection pool in WAL mode, which is
//! also what makes [`Store::tx`] work: statements issued by the transaction
//! closure land on the connection that ran `BEGIN`.

mod migrations;
mod rows;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::debug;

use crate::entities::{
    ApprovalStatus, AuditAggregate, AuditFilter, AuditRecord, AuthScope, DownstreamServer, OAuthProvider, RouteRule,
    SessionRecord, ToolApproval, Workspace,
};
use crate::error::{StoreError, StoreResult};
use crate::store::{Store, TxFn};

use rows::ts;

/// SQLite implementation of the composite [`Store`]
pub struct SqliteStore {
    pool: SqlitePool,
    /// Serializes `tx` sections; see [`Store::tx`]
    tx_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and apply pending
    /// migrations.
    pub async fn open(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        migrations::run(&pool).await?;
        debug!(path, "opened sqlite store");

        Ok(Self {
            pool,
            tx_lock: Mutex::new(()),
        })
    }

    /// In-memory store for tests
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::open(":memory:").await
    }

    fn map_insert_err(err: sqlx::Error, entity: &'static str, id: &str) -> StoreError {
        if err
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation())
        {
            StoreError::already_exists(entity, id)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    // ---- workspaces ----

    async fn create_workspace(&self, workspace: &Workspace) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workspaces (id, name, root_path, default_policy, source, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.root_path)
        .bind(workspace.default_policy.as_str())
        .bind(workspace.source.as_str())
        .bind(ts(&workspace.created_at))
        .bind(ts(&workspace.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "workspace", &workspace.id))?;
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> StoreResult<Workspace> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("workspace", id))?;
        rows::workspace(&row)
    }

    async fn get_workspace_by_name(&self, name: &str) -> StoreResult<Workspace> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("workspace", name))?;
        rows::workspace(&row)
    }

    async fn list_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let raw = sqlx::query("SELECT * FROM workspaces ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::workspace).collect()
    }

    async fn update_workspace(&self, workspace: &Workspace) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workspaces SET name = ?, root_path = ?, default_policy = ?, source = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&workspace.name)
        .bind(&workspace.root_path)
        .bind(workspace.default_policy.as_str())
        .bind(workspace.source.as_str())
        .bind(ts(&Utc::now()))
        .bind(&workspace.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workspace", &workspace.id));
        }
        Ok(())
    }

    async fn delete_workspace(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workspace", id));
        }
        Ok(())
    }

    // ---- auth scopes ----

    async fn create_auth_scope(&self, scope: &AuthScope) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO auth_scopes (id, name, scope_type, oauth_provider_id, encrypted_data,
                                      oauth_token_data, source, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&scope.id)
        .bind(&scope.name)
        .bind(scope.scope_type.as_str())
        .bind(&scope.oauth_provider_id)
        .bind(&scope.encrypted_data)
        .bind(&scope.oauth_token_data)
        .bind(scope.source.as_str())
        .bind(ts(&scope.created_at))
        .bind(ts(&scope.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "auth scope", &scope.id))?;
        Ok(())
    }

    async fn get_auth_scope(&self, id: &str) -> StoreResult<AuthScope> {
        let row = sqlx::query("SELECT * FROM auth_scopes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("auth scope", id))?;
        rows::auth_scope(&row)
    }

    async fn list_auth_scopes(&self) -> StoreResult<Vec<AuthScope>> {
        let raw = sqlx::query("SELECT * FROM auth_scopes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::auth_scope).collect()
    }

    async fn update_auth_scope(&self, scope: &AuthScope) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE auth_scopes SET name = ?, scope_type = ?, oauth_provider_id = ?, encrypted_data = ?,
                                    oauth_token_data = ?, source = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&scope.name)
        .bind(scope.scope_type.as_str())
        .bind(&scope.oauth_provider_id)
        .bind(&scope.encrypted_data)
        .bind(&scope.oauth_token_data)
        .bind(scope.source.as_str())
        .bind(ts(&Utc::now()))
        .bind(&scope.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("auth scope", &scope.id));
        }
        Ok(())
    }

    async fn delete_auth_scope(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM auth_scopes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("auth scope", id));
        }
        Ok(())
    }

    async fn update_auth_scope_token_data(&self, id: &str, token_data: Option<&[u8]>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE auth_scopes SET oauth_token_data = ?, updated_at = ? WHERE id = ?")
            .bind(token_data)
            .bind(ts(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("auth scope", id));
        }
        Ok(())
    }

    // ---- oauth providers ----

    async fn create_oauth_provider(&self, provider: &OAuthProvider) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO oauth_providers (id, name, template_id, authorize_url, token_url, client_id,
                                          client_secret_enc, scopes, use_pkce, source, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&provider.id)
        .bind(&provider.name)
        .bind(&provider.template_id)
        .bind(&provider.authorize_url)
        .bind(&provider.token_url)
        .bind(&provider.client_id)
        .bind(&provider.client_secret_enc)
        .bind(serde_json::to_string(&provider.scopes)?)
        .bind(provider.use_pkce)
        .bind(provider.source.as_str())
        .bind(ts(&provider.created_at))
        .bind(ts(&provider.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "oauth provider", &provider.id))?;
        Ok(())
    }

    async fn get_oauth_provider(&self, id: &str) -> StoreResult<OAuthProvider> {
        let row = sqlx::query("SELECT * FROM oauth_providers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("oauth provider", id))?;
        rows::oauth_provider(&row)
    }

    async fn get_oauth_provider_by_name(&self, name: &str) -> StoreResult<OAuthProvider> {
        let row = sqlx::query("SELECT * FROM oauth_providers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("oauth provider", name))?;
        rows::oauth_provider(&row)
    }

    async fn list_oauth_providers(&self) -> StoreResult<Vec<OAuthProvider>> {
        let raw = sqlx::query("SELECT * FROM oauth_providers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::oauth_provider).collect()
    }

    async fn update_oauth_provider(&self, provider: &OAuthProvider) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE oauth_providers SET name = ?, template_id = ?, authorize_url = ?, token_url = ?,
                                        client_id = ?, client_secret_enc = ?, scopes = ?, use_pkce = ?,
                                        source = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&provider.name)
        .bind(&provider.template_id)
        .bind(&provider.authorize_url)
        .bind(&provider.token_url)
        .bind(&provider.client_id)
        .bind(&provider.client_secret_enc)
        .bind(serde_json::to_string(&provider.scopes)?)
        .bind(provider.use_pkce)
        .bind(provider.source.as_str())
        .bind(ts(&Utc::now()))
        .bind(&provider.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("oauth provider", &provider.id));
        }
        Ok(())
    }

    async fn delete_oauth_provider(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM oauth_providers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("oauth provider", id));
        }
        Ok(())
    }

    // ---- downstream servers ----

    async fn create_downstream_server(&self, server: &DownstreamServer) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO downstream_servers (id, name, transport, command, args, env, url, tool_namespace,
                                             discovery, capabilities_cache, idle_timeout_sec, max_instances,
                                             restart_policy, disabled, source, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(server.transport.as_str())
        .bind(&server.command)
        .bind(serde_json::to_string(&server.args)?)
        .bind(serde_json::to_string(&server.env)?)
        .bind(&server.url)
        .bind(&server.tool_namespace)
        .bind(server.discovery.as_str())
        .bind(&server.capabilities_cache)
        .bind(server.idle_timeout_sec as i64)
        .bind(server.max_instances as i64)
        .bind(server.restart_policy.as_str())
        .bind(server.disabled)
        .bind(server.source.as_str())
        .bind(ts(&server.created_at))
        .bind(ts(&server.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "downstream server", &server.id))?;
        Ok(())
    }

    async fn get_downstream_server(&self, id: &str) -> StoreResult<DownstreamServer> {
        let row = sqlx::query("SELECT * FROM downstream_servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("downstream server", id))?;
        rows::downstream_server(&row)
    }

    async fn get_downstream_server_by_name(&self, name: &str) -> StoreResult<DownstreamServer> {
        let row = sqlx::query("SELECT * FROM downstream_servers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("downstream server", name))?;
        rows::downstream_server(&row)
    }

    async fn list_downstream_servers(&self) -> StoreResult<Vec<DownstreamServer>> {
        let raw = sqlx::query("SELECT * FROM downstream_servers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::downstream_server).collect()
    }

    async fn update_downstream_server(&self, server: &DownstreamServer) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE downstream_servers SET name = ?, transport = ?, command = ?, args = ?, env = ?, url = ?,
                                           tool_namespace = ?, discovery = ?, idle_timeout_sec = ?,
                                           max_instances = ?, restart_policy = ?, disabled = ?, source = ?,
                                           updated_at = ?
             WHERE id = ?",
        )
        .bind(&server.name)
        .bind(server.transport.as_str())
        .bind(&server.command)
        .bind(serde_json::to_string(&server.args)?)
        .bind(serde_json::to_string(&server.env)?)
        .bind(&server.url)
        .bind(&server.tool_namespace)
        .bind(server.discovery.as_str())
        .bind(server.idle_timeout_sec as i64)
        .bind(server.max_instances as i64)
        .bind(server.restart_policy.as_str())
        .bind(server.disabled)
        .bind(server.source.as_str())
        .bind(ts(&Utc::now()))
        .bind(&server.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("downstream server", &server.id));
        }
        Ok(())
    }

    async fn delete_downstream_server(&self, id: &str) -> StoreResult<()> {
        let _guard = self.tx_lock.lock().await;
        let mut txn = self.pool.begin().await?;

        let now = ts(&Utc::now());
        sqlx::query(
            "UPDATE tool_approvals SET status = 'cancelled', resolve_reason = 'downstream server deleted',
                                       resolved_at = ?
             WHERE server_id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(id)
        .execute(&mut *txn)
        .await?;

        sqlx::query("DELETE FROM route_rules WHERE downstream_server_id = ?")
            .bind(id)
            .execute(&mut *txn)
            .await?;

        let result = sqlx::query("DELETE FROM downstream_servers WHERE id = ?")
            .bind(id)
            .execute(&mut *txn)
            .await?;
        if result.rows_affected() == 0 {
            txn.rollback().await?;
            return Err(StoreError::not_found("downstream server", id));
        }

        txn.commit().await?;
        Ok(())
    }

    async fn update_capabilities_cache(&self, id: &str, snapshot: &[u8]) -> StoreResult<()> {
        let result = sqlx::query("UPDATE downstream_servers SET capabilities_cache = ?, updated_at = ? WHERE id = ?")
            .bind(snapshot)
            .bind(ts(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("downstream server", id));
        }
        Ok(())
    }

    // ---- route rules ----

    async fn create_route_rule(&self, rule: &RouteRule) -> StoreResult<()> {
        rule.validate().map_err(StoreError::validation)?;
        sqlx::query(
            "INSERT INTO route_rules (id, priority, workspace_id, path_glob, tool_match, downstream_server_id,
                                      auth_scope_id, policy, requires_approval, approval_timeout_sec, source,
                                      created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id)
        .bind(rule.priority)
        .bind(&rule.workspace_id)
        .bind(&rule.path_glob)
        .bind(serde_json::to_string(&rule.tool_match)?)
        .bind(&rule.downstream_server_id)
        .bind(&rule.auth_scope_id)
        .bind(rule.policy.as_str())
        .bind(rule.requires_approval)
        .bind(rule.approval_timeout_sec.map(|v| v as i64))
        .bind(rule.source.as_str())
        .bind(ts(&rule.created_at))
        .bind(ts(&rule.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "route rule", &rule.id))?;
        Ok(())
    }

    async fn get_route_rule(&self, id: &str) -> StoreResult<RouteRule> {
        let row = sqlx::query("SELECT * FROM route_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("route rule", id))?;
        rows::route_rule(&row)
    }

    async fn list_route_rules(&self) -> StoreResult<Vec<RouteRule>> {
        let raw = sqlx::query("SELECT * FROM route_rules ORDER BY priority DESC, id")
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::route_rule).collect()
    }

    async fn list_route_rules_for_workspace(&self, workspace_id: &str) -> StoreResult<Vec<RouteRule>> {
        let raw = sqlx::query("SELECT * FROM route_rules WHERE workspace_id = ? ORDER BY priority DESC, id")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::route_rule).collect()
    }

    async fn update_route_rule(&self, rule: &RouteRule) -> StoreResult<()> {
        rule.validate().map_err(StoreError::validation)?;
        let result = sqlx::query(
            "UPDATE route_rules SET priority = ?, workspace_id = ?, path_glob = ?, tool_match = ?,
                                    downstream_server_id = ?, auth_scope_id = ?, policy = ?,
                                    requires_approval = ?, approval_timeout_sec = ?, source = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(rule.priority)
        .bind(&rule.workspace_id)
        .bind(&rule.path_glob)
        .bind(serde_json::to_string(&rule.tool_match)?)
        .bind(&rule.downstream_server_id)
        .bind(&rule.auth_scope_id)
        .bind(rule.policy.as_str())
        .bind(rule.requires_approval)
        .bind(rule.approval_timeout_sec.map(|v| v as i64))
        .bind(rule.source.as_str())
        .bind(ts(&Utc::now()))
        .bind(&rule.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("route rule", &rule.id));
        }
        Ok(())
    }

    async fn delete_route_rule(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM route_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("route rule", id));
        }
        Ok(())
    }

    // ---- sessions ----

    async fn create_session(&self, session: &SessionRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sessions (id, client_type, client_pid, connected_at, disconnected_at, workspace_id, model_hint)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.client_type)
        .bind(session.client_pid)
        .bind(ts(&session.connected_at))
        .bind(session.disconnected_at.as_ref().map(ts))
        .bind(&session.workspace_id)
        .bind(&session.model_hint)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "session", &session.id))?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("session", id))?;
        rows::session(&row)
    }

    async fn update_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET client_type = ?, client_pid = ?, disconnected_at = ?, workspace_id = ?, model_hint = ?
             WHERE id = ?",
        )
        .bind(&session.client_type)
        .bind(session.client_pid)
        .bind(session.disconnected_at.as_ref().map(ts))
        .bind(&session.workspace_id)
        .bind(&session.model_hint)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("session", &session.id));
        }
        Ok(())
    }

    async fn close_session(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE sessions SET disconnected_at = ? WHERE id = ?")
            .bind(ts(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("session", id));
        }
        Ok(())
    }

    async fn cleanup_stale_sessions(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET disconnected_at = connected_at
             WHERE disconnected_at IS NULL AND connected_at < ?",
        )
        .bind(ts(&before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- audit ----

    async fn insert_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_records (id, session_id, workspace_id, server_id, tool_name, matched_rule_id,
                                        status, error_code, error_message, blocked_reason, latency_ms,
                                        response_bytes, params_redacted, cache_hit, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.workspace_id)
        .bind(&record.server_id)
        .bind(&record.tool_name)
        .bind(&record.matched_rule_id)
        .bind(record.status.as_str())
        .bind(record.error_code)
        .bind(&record.error_message)
        .bind(&record.blocked_reason)
        .bind(record.latency_ms)
        .bind(record.response_bytes)
        .bind(
            record
                .params_redacted
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(record.cache_hit)
        .bind(ts(&record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "audit record", &record.id))?;
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        let mut sql = String::from("SELECT * FROM audit_records WHERE 1=1");
        if filter.workspace_id.is_some() {
            sql.push_str(" AND workspace_id = ?");
        }
        if filter.server_id.is_some() {
            sql.push_str(" AND server_id = ?");
        }
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(" LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(v) = &filter.workspace_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.server_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.session_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.status {
            query = query.bind(v.as_str());
        }
        if let Some(v) = &filter.since {
            query = query.bind(ts(v));
        }
        if let Some(v) = &filter.until {
            query = query.bind(ts(v));
        }
        query = query.bind(filter.limit.unwrap_or(1000));

        let raw = query.fetch_all(&self.pool).await?;
        raw.iter().map(rows::audit_record).collect()
    }

    async fn audit_aggregates(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditAggregate>> {
        let mut sql = String::from(
            "SELECT server_id,
                    COUNT(*) AS calls,
                    SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS errors,
                    SUM(CASE WHEN status = 'blocked' THEN 1 ELSE 0 END) AS blocked,
                    AVG(latency_ms) AS avg_latency_ms
             FROM audit_records WHERE 1=1",
        );
        if filter.workspace_id.is_some() {
            sql.push_str(" AND workspace_id = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" GROUP BY server_id ORDER BY calls DESC");

        let mut query = sqlx::query(&sql);
        if let Some(v) = &filter.workspace_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.since {
            query = query.bind(ts(v));
        }
        if let Some(v) = &filter.until {
            query = query.bind(ts(v));
        }

        use sqlx::Row as _;
        let raw = query.fetch_all(&self.pool).await?;
        raw.iter()
            .map(|row| {
                Ok(AuditAggregate {
                    server_id: row.try_get("server_id")?,
                    calls: row.try_get("calls")?,
                    errors: row.try_get("errors")?,
                    blocked: row.try_get("blocked")?,
                    avg_latency_ms: row.try_get::<Option<f64>, _>("avg_latency_ms")?.unwrap_or(0.0),
                })
            })
            .collect()
    }

    // ---- tool approvals ----

    async fn create_tool_approval(&self, approval: &ToolApproval) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tool_approvals (id, status, tool_name, workspace_id, server_id, model_hint,
                                         params_summary, resolved_by, resolve_reason, created_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&approval.id)
        .bind(approval.status.as_str())
        .bind(&approval.tool_name)
        .bind(&approval.workspace_id)
        .bind(&approval.server_id)
        .bind(&approval.model_hint)
        .bind(&approval.params_summary)
        .bind(&approval.resolved_by)
        .bind(&approval.resolve_reason)
        .bind(ts(&approval.created_at))
        .bind(approval.resolved_at.as_ref().map(ts))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_err(e, "tool approval", &approval.id))?;
        Ok(())
    }

    async fn get_tool_approval(&self, id: &str) -> StoreResult<ToolApproval> {
        let row = sqlx::query("SELECT * FROM tool_approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("tool approval", id))?;
        rows::tool_approval(&row)
    }

    async fn list_pending_approvals(&self) -> StoreResult<Vec<ToolApproval>> {
        let raw = sqlx::query("SELECT * FROM tool_approvals WHERE status = 'pending' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        raw.iter().map(rows::tool_approval).collect()
    }

    async fn resolve_tool_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolved_by: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ToolApproval> {
        if !status.is_resolved() {
            return Err(StoreError::validation("resolution status must be terminal"));
        }

        // Guard on status = 'pending' so the first resolver wins.
        let result = sqlx::query(
            "UPDATE tool_approvals SET status = ?, resolved_by = ?, resolve_reason = ?, resolved_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(resolved_by)
        .bind(reason)
        .bind(ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish missing from already-resolved
            let existing = self.get_tool_approval(id).await?;
            return Err(StoreError::conflict(format!(
                "approval {id} already resolved as {}",
                existing.status.as_str()
            )));
        }

        self.get_tool_approval(id).await
    }

    async fn expire_pending_approvals(&self, before: DateTime<Utc>) -> StoreResult<Vec<String>> {
        use sqlx::Row as _;
        let stale = sqlx::query("SELECT id FROM tool_approvals WHERE status = 'pending' AND created_at < ?")
            .bind(ts(&before))
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<String> = stale
            .iter()
            .filter_map(|row| row.try_get::<String, _>("id").ok())
            .collect();

        if !ids.is_empty() {
            let now = ts(&Utc::now());
            for id in &ids {
                sqlx::query(
                    "UPDATE tool_approvals SET status = 'timeout', resolve_reason = 'expired', resolved_at = ?
                     WHERE id = ? AND status = 'pending'",
                )
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(ids)
    }

    // ---- transactions ----

    async fn tx(&self, f: TxFn) -> StoreResult<()> {
        let _guard = self.tx_lock.lock().await;
        sqlx::query("BEGIN IMMEDIATE").execute(&self.pool).await?;
        match f(self).await {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&self.pool).await?;
                Ok(())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&self.pool).await;
                Err(err)
            }
        }
    }
}
