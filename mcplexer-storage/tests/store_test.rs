//! Integration tests for the SQLite store

use chrono::{Duration, Utc};
use mcplexer_storage::entities::{
    ApprovalStatus, AuditFilter, AuditRecord, AuditStatus, AuthScope, DownstreamServer, RecordSource, RoutePolicy,
    RouteRule, ScopeKind, SessionRecord, ToolApproval, Workspace,
};
use mcplexer_storage::sync::{sync_yaml, YamlState};
use mcplexer_storage::{SqliteStore, Store, StoreError};

async fn store() -> SqliteStore {
    SqliteStore::open_in_memory().await.expect("open in-memory store")
}

#[tokio::test]
async fn migrations_apply_once_across_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db").display().to_string();

    let first = SqliteStore::open(&path).await.unwrap();
    let ws = Workspace::new("global", "/", RoutePolicy::Deny);
    first.create_workspace(&ws).await.unwrap();
    drop(first);

    // Reopening must not re-run migrations or lose data.
    let second = SqliteStore::open(&path).await.unwrap();
    let fetched = second.get_workspace_by_name("global").await.unwrap();
    assert_eq!(fetched.id, ws.id);
}

#[tokio::test]
async fn workspace_crud_and_sentinels() {
    let store = store().await;

    let ws = Workspace::new("global", "/", RoutePolicy::Deny);
    store.create_workspace(&ws).await.unwrap();

    let fetched = store.get_workspace(&ws.id).await.unwrap();
    assert_eq!(fetched.name, "global");
    assert_eq!(fetched.default_policy, RoutePolicy::Deny);

    let by_name = store.get_workspace_by_name("global").await.unwrap();
    assert_eq!(by_name.id, ws.id);

    // Unique name violation surfaces as AlreadyExists
    let dup = Workspace::new("global", "/tmp", RoutePolicy::Allow);
    let err = store.create_workspace(&dup).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));

    let err = store.get_workspace("missing").await.unwrap_err();
    assert!(err.is_not_found());

    store.delete_workspace(&ws.id).await.unwrap();
    assert!(store.get_workspace(&ws.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn allow_rule_requires_downstream() {
    let store = store().await;
    let ws = Workspace::new("w", "/w", RoutePolicy::Deny);
    store.create_workspace(&ws).await.unwrap();

    let mut rule = RouteRule::deny(&ws.id, "**");
    rule.policy = RoutePolicy::Allow; // allow without a server
    let err = store.create_route_rule(&rule).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation { .. }));
}

#[tokio::test]
async fn deleting_server_cascades_rules_and_cancels_approvals() {
    let store = store().await;

    let ws = Workspace::new("w", "/w", RoutePolicy::Deny);
    store.create_workspace(&ws).await.unwrap();

    let server = DownstreamServer::stdio("filesystem", "fs", "mcp-fs", vec![]);
    store.create_downstream_server(&server).await.unwrap();

    let rule = RouteRule::allow(&ws.id, "**", &server.id);
    store.create_route_rule(&rule).await.unwrap();

    let mut approval = ToolApproval::pending("fs__list");
    approval.server_id = Some(server.id.clone());
    store.create_tool_approval(&approval).await.unwrap();

    store.delete_downstream_server(&server.id).await.unwrap();

    assert!(store.get_route_rule(&rule.id).await.unwrap_err().is_not_found());
    let cancelled = store.get_tool_approval(&approval.id).await.unwrap();
    assert_eq!(cancelled.status, ApprovalStatus::Cancelled);
}

#[tokio::test]
async fn resolve_approval_is_single_shot() {
    let store = store().await;

    let approval = ToolApproval::pending("gh__merge");
    store.create_tool_approval(&approval).await.unwrap();

    let resolved = store
        .resolve_tool_approval(&approval.id, ApprovalStatus::Approved, Some("alex"), None, Utc::now())
        .await
        .unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("alex"));

    let err = store
        .resolve_tool_approval(&approval.id, ApprovalStatus::Denied, Some("sam"), None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
}

#[tokio::test]
async fn expire_marks_only_stale_pendings() {
    let store = store().await;

    let mut old = ToolApproval::pending("a__x");
    old.created_at = Utc::now() - Duration::minutes(30);
    store.create_tool_approval(&old).await.unwrap();

    let fresh = ToolApproval::pending("a__y");
    store.create_tool_approval(&fresh).await.unwrap();

    let expired = store
        .expire_pending_approvals(Utc::now() - Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(expired, vec![old.id.clone()]);

    assert_eq!(
        store.get_tool_approval(&old.id).await.unwrap().status,
        ApprovalStatus::Timeout
    );
    assert_eq!(
        store.get_tool_approval(&fresh.id).await.unwrap().status,
        ApprovalStatus::Pending
    );
}

#[tokio::test]
async fn stale_session_sweep() {
    let store = store().await;

    let mut stale = SessionRecord::new();
    stale.connected_at = Utc::now() - Duration::hours(48);
    store.create_session(&stale).await.unwrap();

    let live = SessionRecord::new();
    store.create_session(&live).await.unwrap();

    let swept = store
        .cleanup_stale_sessions(Utc::now() - Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    assert!(!store.get_session(&stale.id).await.unwrap().is_active());
    assert!(store.get_session(&live.id).await.unwrap().is_active());
}

#[tokio::test]
async fn audit_query_and_aggregates() {
    let store = store().await;

    let mut ok = AuditRecord::new("fs__list", AuditStatus::Success);
    ok.server_id = Some("srv-1".into());
    ok.latency_ms = 20;
    store.insert_audit(&ok).await.unwrap();

    let mut failed = AuditRecord::new("fs__read", AuditStatus::Error);
    failed.server_id = Some("srv-1".into());
    failed.latency_ms = 40;
    failed.error_code = Some(-32000);
    store.insert_audit(&failed).await.unwrap();

    let mut blocked = AuditRecord::new("gh__merge", AuditStatus::Blocked);
    blocked.blocked_reason = Some("denied by rule".into());
    store.insert_audit(&blocked).await.unwrap();

    let errors = store
        .query_audit(&AuditFilter {
            status: Some(AuditStatus::Error),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].tool_name, "fs__read");

    let aggregates = store.audit_aggregates(&AuditFilter::default()).await.unwrap();
    let srv = aggregates
        .iter()
        .find(|a| a.server_id.as_deref() == Some("srv-1"))
        .unwrap();
    assert_eq!(srv.calls, 2);
    assert_eq!(srv.errors, 1);
    assert!((srv.avg_latency_ms - 30.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn token_data_roundtrip() {
    let store = store().await;

    let mut scope = AuthScope::new("github-oauth", ScopeKind::Oauth2);
    scope.oauth_provider_id = Some("prov-1".into());
    store.create_auth_scope(&scope).await.unwrap();

    store
        .update_auth_scope_token_data(&scope.id, Some(b"sealed-bytes"))
        .await
        .unwrap();
    let fetched = store.get_auth_scope(&scope.id).await.unwrap();
    assert_eq!(fetched.oauth_token_data.as_deref(), Some(&b"sealed-bytes"[..]));

    store.update_auth_scope_token_data(&scope.id, None).await.unwrap();
    assert!(store.get_auth_scope(&scope.id).await.unwrap().oauth_token_data.is_none());
}

#[tokio::test]
async fn tx_rolls_back_on_error() {
    let store = store().await;

    let ws = Workspace::new("w", "/w", RoutePolicy::Deny);
    let ws_id = ws.id.clone();
    let result = store
        .tx(Box::new(move |s| {
            Box::pin(async move {
                s.create_workspace(&ws).await?;
                Err(StoreError::conflict("abort"))
            })
        }))
        .await;
    assert!(result.is_err());
    assert!(store.get_workspace(&ws_id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn yaml_sync_upserts_and_prunes() {
    let store = store().await;

    // A pre-existing API-sourced workspace must survive sync untouched.
    let api_ws = Workspace::new("manual", "/manual", RoutePolicy::Allow);
    store.create_workspace(&api_ws).await.unwrap();

    let desired = YamlState {
        workspaces: vec![Workspace::new("global", "/", RoutePolicy::Deny)],
        servers: vec![DownstreamServer::stdio("filesystem", "fs", "mcp-fs", vec![])],
        ..Default::default()
    };
    let report = sync_yaml(&store, desired).await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.pruned, 0);

    let ws = store.get_workspace_by_name("global").await.unwrap();
    assert_eq!(ws.source, RecordSource::Yaml);

    // Second sync without the server prunes it but keeps the workspace.
    let desired = YamlState {
        workspaces: vec![Workspace::new("global", "/", RoutePolicy::Deny)],
        ..Default::default()
    };
    let report = sync_yaml(&store, desired).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.pruned, 1);

    assert!(store
        .get_downstream_server_by_name("filesystem")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store.get_workspace_by_name("manual").await.is_ok());
}
