//! Routing engine behavior against a real (in-memory) store

use std::sync::Arc;

use mcplexer_routing::{RouteContext, RouteError, RoutingEngine};
use mcplexer_storage::entities::{DownstreamServer, RoutePolicy, RouteRule, Workspace};
use mcplexer_storage::{SqliteStore, Store};

struct Fixture {
    store: Arc<SqliteStore>,
    engine: RoutingEngine,
    workspace_id: String,
}

async fn fixture() -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let workspace = Workspace::new("global", "/", RoutePolicy::Deny);
    store.create_workspace(&workspace).await.unwrap();
    let engine = RoutingEngine::new(store.clone() as Arc<dyn Store>);
    Fixture {
        store,
        engine,
        workspace_id: workspace.id,
    }
}

fn ctx(workspace_id: &str, subpath: &str, tool: &str) -> RouteContext {
    RouteContext {
        workspace_id: workspace_id.to_string(),
        subpath: subpath.to_string(),
        tool_name: tool.to_string(),
    }
}

async fn add_server(store: &SqliteStore, name: &str, namespace: &str) -> DownstreamServer {
    let server = DownstreamServer::stdio(name, namespace, format!("mcp-{name}"), vec![]);
    store.create_downstream_server(&server).await.unwrap();
    server
}

#[tokio::test]
async fn first_rule_under_ordering_wins() {
    let fx = fixture().await;
    let server = add_server(&fx.store, "filesystem", "fs").await;

    // Same path specificity; higher priority must win.
    let mut low = RouteRule::allow(&fx.workspace_id, "**", &server.id);
    low.priority = 1;
    low.tool_match = vec!["fs__*".into()];
    fx.store.create_route_rule(&low).await.unwrap();

    let mut high = RouteRule::allow(&fx.workspace_id, "**", &server.id);
    high.priority = 100;
    high.tool_match = vec!["fs__*".into()];
    high.requires_approval = true;
    fx.store.create_route_rule(&high).await.unwrap();

    let decision = fx.engine.route(&ctx(&fx.workspace_id, "src", "fs__list")).await.unwrap();
    assert_eq!(decision.matched_rule_id, high.id);
    assert!(decision.requires_approval);
}

#[tokio::test]
async fn specific_path_beats_high_priority_catch_all() {
    // Scenario: deny-everything at priority 1000 vs a targeted allow at
    // priority 1. The targeted path must win.
    let fx = fixture().await;
    let server = add_server(&fx.store, "linear", "linear").await;

    let mut deny_all = RouteRule::deny(&fx.workspace_id, "**");
    deny_all.priority = 1000;
    fx.store.create_route_rule(&deny_all).await.unwrap();

    let mut allow_ui = RouteRule::allow(&fx.workspace_id, "src/ui/**", &server.id);
    allow_ui.priority = 1;
    fx.store.create_route_rule(&allow_ui).await.unwrap();

    let decision = fx
        .engine
        .route(&ctx(&fx.workspace_id, "src/ui/app", "linear__issue"))
        .await
        .unwrap();
    assert_eq!(decision.matched_rule_id, allow_ui.id);

    // Outside the targeted path the catch-all deny applies.
    let err = fx
        .engine
        .route(&ctx(&fx.workspace_id, "docs", "linear__issue"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Denied { rule_id } if rule_id == deny_all.id));
}

#[tokio::test]
async fn deny_at_same_specificity_cannot_be_overridden_by_lower() {
    let fx = fixture().await;
    let server = add_server(&fx.store, "github", "github").await;

    let mut deny = RouteRule::deny(&fx.workspace_id, "src/**");
    deny.priority = 50;
    fx.store.create_route_rule(&deny).await.unwrap();

    let mut allow = RouteRule::allow(&fx.workspace_id, "src/**", &server.id);
    allow.priority = 10;
    fx.store.create_route_rule(&allow).await.unwrap();

    let err = fx
        .engine
        .route(&ctx(&fx.workspace_id, "src/app", "github__list_prs"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Denied { rule_id } if rule_id == deny.id));
}

#[tokio::test]
async fn namespace_guard_partitions_broad_rules() {
    // Scenario: an fs rule and a github rule both use `**` paths; the
    // github call must land on the github rule even though the fs rule
    // sorts first by priority.
    let fx = fixture().await;
    let fs = add_server(&fx.store, "filesystem", "fs").await;
    let github = add_server(&fx.store, "github", "github").await;

    let mut fs_rule = RouteRule::allow(&fx.workspace_id, "**", &fs.id);
    fs_rule.priority = 100;
    fx.store.create_route_rule(&fs_rule).await.unwrap();

    let mut github_rule = RouteRule::allow(&fx.workspace_id, "**", &github.id);
    github_rule.priority = 10;
    github_rule.tool_match = vec!["github__*".into()];
    fx.store.create_route_rule(&github_rule).await.unwrap();

    let decision = fx
        .engine
        .route(&ctx(&fx.workspace_id, "src", "github__list_prs"))
        .await
        .unwrap();
    assert_eq!(decision.matched_rule_id, github_rule.id);
    assert_eq!(decision.downstream_server_id, github.id);
}

#[tokio::test]
async fn fallback_walks_ancestors_nearest_first() {
    let fx = fixture().await;
    let server = add_server(&fx.store, "filesystem", "fs").await;

    let child = Workspace::new("project", "/home/u/project", RoutePolicy::Deny);
    fx.store.create_workspace(&child).await.unwrap();

    // Only the global (ancestor) workspace carries a rule.
    let rule = RouteRule::allow(&fx.workspace_id, "**", &server.id);
    fx.store.create_route_rule(&rule).await.unwrap();

    let ancestors = vec![
        ctx(&child.id, "src", "fs__list"),
        ctx(&fx.workspace_id, "home/u/project/src", "fs__list"),
    ];
    let decision = fx.engine.route_with_fallback(&ancestors).await.unwrap();
    assert_eq!(decision.matched_rule_id, rule.id);
}

#[tokio::test]
async fn fallback_stops_on_deny() {
    let fx = fixture().await;
    let server = add_server(&fx.store, "filesystem", "fs").await;

    let child = Workspace::new("project", "/home/u/project", RoutePolicy::Deny);
    fx.store.create_workspace(&child).await.unwrap();

    let deny = RouteRule::deny(&child.id, "**");
    fx.store.create_route_rule(&deny).await.unwrap();

    let allow = RouteRule::allow(&fx.workspace_id, "**", &server.id);
    fx.store.create_route_rule(&allow).await.unwrap();

    let ancestors = vec![
        ctx(&child.id, "src", "fs__list"),
        ctx(&fx.workspace_id, "home/u/project/src", "fs__list"),
    ];
    let err = fx.engine.route_with_fallback(&ancestors).await.unwrap_err();
    assert!(matches!(err, RouteError::Denied { rule_id } if rule_id == deny.id));
}

#[tokio::test]
async fn empty_ancestor_list_is_no_route() {
    let fx = fixture().await;
    let err = fx.engine.route_with_fallback(&[]).await.unwrap_err();
    assert!(matches!(err, RouteError::NoRoute));
}

#[tokio::test]
async fn disabled_servers_never_match() {
    let fx = fixture().await;
    let mut server = DownstreamServer::stdio("filesystem", "fs", "mcp-fs", vec![]);
    server.disabled = true;
    fx.store.create_downstream_server(&server).await.unwrap();

    let rule = RouteRule::allow(&fx.workspace_id, "**", &server.id);
    fx.store.create_route_rule(&rule).await.unwrap();

    let err = fx
        .engine
        .route(&ctx(&fx.workspace_id, "src", "fs__list"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::NoRoute));
}

#[tokio::test]
async fn cache_serves_hits_until_invalidated() {
    let fx = fixture().await;
    let server = add_server(&fx.store, "filesystem", "fs").await;
    let rule = RouteRule::allow(&fx.workspace_id, "**", &server.id);
    fx.store.create_route_rule(&rule).await.unwrap();

    let lookup = ctx(&fx.workspace_id, "src", "fs__list");

    let first = fx.engine.route(&lookup).await.unwrap();
    assert!(!first.cache_hit);

    let second = fx.engine.route(&lookup).await.unwrap();
    assert!(second.cache_hit);

    let stats = fx.engine.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    // Mutate: replace the allow with a deny, then invalidate.
    fx.store.delete_route_rule(&rule.id).await.unwrap();
    let deny = RouteRule::deny(&fx.workspace_id, "**");
    fx.store.create_route_rule(&deny).await.unwrap();
    fx.engine.invalidate_all().await;

    let err = fx.engine.route(&lookup).await.unwrap_err();
    assert!(matches!(err, RouteError::Denied { .. }));
}
