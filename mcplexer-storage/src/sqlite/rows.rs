//! Row → entity mapping for the SQLite store

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::entities::{
    ApprovalStatus, AuditRecord, AuditStatus, AuthScope, DiscoveryMode, DownstreamServer, OAuthProvider, RecordSource,
    RestartPolicy, RoutePolicy, RouteRule, ScopeKind, SessionRecord, ToolApproval, TransportKind, Workspace,
};
use crate::error::{StoreError, StoreResult};

pub(super) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(super) fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization {
            message: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn get_ts(row: &SqliteRow, col: &str) -> StoreResult<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    parse_ts(&raw)
}

fn parse_enum<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> StoreResult<T> {
    parse(raw).ok_or_else(|| StoreError::Serialization {
        message: format!("unknown {what}: {raw:?}"),
    })
}

fn source(row: &SqliteRow) -> StoreResult<RecordSource> {
    let raw: String = row.try_get("source")?;
    parse_enum(&raw, RecordSource::parse, "record source")
}

pub(super) fn workspace(row: &SqliteRow) -> StoreResult<Workspace> {
    let policy: String = row.try_get("default_policy")?;
    Ok(Workspace {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        root_path: row.try_get("root_path")?,
        default_policy: parse_enum(&policy, RoutePolicy::parse, "route policy")?,
        source: source(row)?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

pub(super) fn downstream_server(row: &SqliteRow) -> StoreResult<DownstreamServer> {
    let transport: String = row.try_get("transport")?;
    let discovery: String = row.try_get("discovery")?;
    let restart: String = row.try_get("restart_policy")?;
    let args_json: String = row.try_get("args")?;
    let env_json: String = row.try_get("env")?;
    let args: Vec<String> = serde_json::from_str(&args_json)?;
    let env: HashMap<String, String> = serde_json::from_str(&env_json)?;

    Ok(DownstreamServer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        transport: parse_enum(&transport, TransportKind::parse, "transport")?,
        command: row.try_get("command")?,
        args,
        env,
        url: row.try_get("url")?,
        tool_namespace: row.try_get("tool_namespace")?,
        discovery: parse_enum(&discovery, DiscoveryMode::parse, "discovery mode")?,
        capabilities_cache: row.try_get("capabilities_cache")?,
        idle_timeout_sec: row.try_get::<i64, _>("idle_timeout_sec")? as u64,
        max_instances: row.try_get::<i64, _>("max_instances")? as u32,
        restart_policy: parse_enum(&restart, RestartPolicy::parse, "restart policy")?,
        disabled: row.try_get("disabled")?,
        source: source(row)?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

pub(super) fn oauth_provider(row: &SqliteRow) -> StoreResult<OAuthProvider> {
    let scopes_json: String = row.try_get("scopes")?;
    Ok(OAuthProvider {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        template_id: row.try_get("template_id")?,
        authorize_url: row.try_get("authorize_url")?,
        token_url: row.try_get("token_url")?,
        client_id: row.try_get("client_id")?,
        client_secret_enc: row.try_get("client_secret_enc")?,
        scopes: serde_json::from_str(&scopes_json)?,
        use_pkce: row.try_get("use_pkce")?,
        source: source(row)?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

pub(super) fn auth_scope(row: &SqliteRow) -> StoreResult<AuthScope> {
    let kind: String = row.try_get("scope_type")?;
    Ok(AuthScope {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        scope_type: parse_enum(&kind, ScopeKind::parse, "scope type")?,
        oauth_provider_id: row.try_get("oauth_provider_id")?,
        encrypted_data: row.try_get("encrypted_data")?,
        oauth_token_data: row.try_get("oauth_token_data")?,
        source: source(row)?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

pub(super) fn route_rule(row: &SqliteRow) -> StoreResult<RouteRule> {
    let policy: String = row.try_get("policy")?;
    let tool_match_json: String = row.try_get("tool_match")?;
    Ok(RouteRule {
        id: row.try_get("id")?,
        priority: row.try_get("priority")?,
        workspace_id: row.try_get("workspace_id")?,
        path_glob: row.try_get("path_glob")?,
        tool_match: serde_json::from_str(&tool_match_json)?,
        downstream_server_id: row.try_get("downstream_server_id")?,
        auth_scope_id: row.try_get("auth_scope_id")?,
        policy: parse_enum(&policy, RoutePolicy::parse, "route policy")?,
        requires_approval: row.try_get("requires_approval")?,
        approval_timeout_sec: row.try_get::<Option<i64>, _>("approval_timeout_sec")?.map(|v| v as u64),
        source: source(row)?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

pub(super) fn session(row: &SqliteRow) -> StoreResult<SessionRecord> {
    Ok(SessionRecord {
        id: row.try_get("id")?,
        client_type: row.try_get("client_type")?,
        client_pid: row.try_get("client_pid")?,
        connected_at: get_ts(row, "connected_at")?,
        disconnected_at: parse_opt_ts(row.try_get("disconnected_at")?)?,
        workspace_id: row.try_get("workspace_id")?,
        model_hint: row.try_get("model_hint")?,
    })
}

pub(super) fn audit_record(row: &SqliteRow) -> StoreResult<AuditRecord> {
    let status: String = row.try_get("status")?;
    let params_raw: Option<String> = row.try_get("params_redacted")?;
    let params_redacted = params_raw.as_deref().map(serde_json::from_str).transpose()?;
    Ok(AuditRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        workspace_id: row.try_get("workspace_id")?,
        server_id: row.try_get("server_id")?,
        tool_name: row.try_get("tool_name")?,
        matched_rule_id: row.try_get("matched_rule_id")?,
        status: parse_enum(&status, AuditStatus::parse, "audit status")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        blocked_reason: row.try_get("blocked_reason")?,
        latency_ms: row.try_get("latency_ms")?,
        response_bytes: row.try_get("response_bytes")?,
        params_redacted,
        cache_hit: row.try_get("cache_hit")?,
        created_at: get_ts(row, "created_at")?,
    })
}

pub(super) fn tool_approval(row: &SqliteRow) -> StoreResult<ToolApproval> {
    let status: String = row.try_get("status")?;
    Ok(ToolApproval {
        id: row.try_get("id")?,
        status: parse_enum(&status, ApprovalStatus::parse, "approval status")?,
        tool_name: row.try_get("tool_name")?,
        workspace_id: row.try_get("workspace_id")?,
        server_id: row.try_get("server_id")?,
        model_hint: row.try_get("model_hint")?,
        params_summary: row.try_get("params_summary")?,
        resolved_by: row.try_get("resolved_by")?,
        resolve_reason: row.try_get("resolve_reason")?,
        created_at: get_ts(row, "created_at")?,
        resolved_at: parse_opt_ts(row.try_get("resolved_at")?)?,
    })
}
