//! Instance pool behavior with real child processes and mock HTTP backends

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcplexer_mcp::{CredentialResolver, DownstreamManager, HeaderOverlay, McpError, McpResult};
use mcplexer_storage::entities::DownstreamServer;
use mcplexer_storage::{SqliteStore, Store};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Resolver that passes the OS environment through and injects nothing
struct NullCredentials;

#[async_trait]
impl CredentialResolver for NullCredentials {
    async fn env_for_scope(&self, _scope_id: &str, server: &DownstreamServer) -> McpResult<HashMap<String, String>> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(server.env.clone());
        Ok(env)
    }

    async fn headers_for_scope(&self, _scope_id: &str) -> McpResult<HeaderOverlay> {
        Ok(HeaderOverlay::new())
    }
}

/// A scripted stdio MCP server: handshakes, then answers tools/list with
/// one tool and tools/call with a canned payload.
const FAKE_SERVER: &str = r#"
read line
printf '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}},"id":1}\n'
read notif
while read line; do
  case "$line" in
    *tools/list*) printf '{"jsonrpc":"2.0","result":{"tools":[{"name":"list","description":"List things"}]},"id":2}\n' ;;
    *tools/call*) printf '{"jsonrpc":"2.0","result":{"content":[{"type":"text","text":"done"}]},"id":3}\n' ;;
    *) printf '{"jsonrpc":"2.0","result":{},"id":99}\n' ;;
  esac
done
"#;

async fn fixture() -> (Arc<SqliteStore>, Arc<DownstreamManager>) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let manager = Arc::new(DownstreamManager::new(
        store.clone() as Arc<dyn Store>,
        Arc::new(NullCredentials),
    ));
    (store, manager)
}

fn scripted_server(name: &str, namespace: &str) -> DownstreamServer {
    DownstreamServer::stdio(name, namespace, "sh", vec!["-c".to_string(), FAKE_SERVER.to_string()])
}

#[tokio::test]
async fn call_lazy_starts_and_reuses_the_instance() {
    let (store, manager) = fixture().await;
    let server = scripted_server("filesystem", "fs");
    store.create_downstream_server(&server).await.unwrap();

    let result = manager.call(&server.id, "", "list", json!({})).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("done"));

    // Second call reuses the pooled instance
    manager.call(&server.id, "", "list", json!({})).await.unwrap();
    let infos = manager.instance_infos().await;
    assert_eq!(infos.len(), 1);

    manager.shutdown().await;
    assert!(manager.instance_infos().await.is_empty());

    // Calls after shutdown lazy-start a fresh instance.
    let result = manager.call(&server.id, "", "list", json!({})).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("done"));
    manager.shutdown().await;
}

#[tokio::test]
async fn disabled_server_fails_get_or_start() {
    let (store, manager) = fixture().await;
    let mut server = scripted_server("filesystem", "fs");
    server.disabled = true;
    store.create_downstream_server(&server).await.unwrap();

    let err = manager.call(&server.id, "", "list", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::Configuration { .. }));
}

#[tokio::test]
async fn instance_limit_bounds_scoped_instances() {
    let (store, manager) = fixture().await;
    let mut server = scripted_server("filesystem", "fs");
    server.max_instances = 1;
    store.create_downstream_server(&server).await.unwrap();

    manager.call(&server.id, "scope-a", "list", json!({})).await.unwrap();
    let err = manager.call(&server.id, "scope-b", "list", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::Configuration { .. }));

    manager.shutdown().await;
}

#[tokio::test]
async fn distinct_scopes_get_distinct_instances() {
    let (store, manager) = fixture().await;
    let server = scripted_server("filesystem", "fs");
    store.create_downstream_server(&server).await.unwrap();

    manager.call(&server.id, "scope-a", "list", json!({})).await.unwrap();
    manager.call(&server.id, "scope-b", "list", json!({})).await.unwrap();
    assert_eq!(manager.instance_infos().await.len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn discovery_fan_out_tolerates_per_server_failure() {
    let (store, manager) = fixture().await;

    let healthy = scripted_server("filesystem", "fs");
    store.create_downstream_server(&healthy).await.unwrap();

    // Points at a binary that does not exist; discovery must skip it.
    let broken = DownstreamServer::stdio("broken", "bad", "missing-binary-a1b2", vec![]);
    store.create_downstream_server(&broken).await.unwrap();

    let catalogs = manager.list_all_tools().await.unwrap();
    assert!(catalogs.contains_key(&healthy.id));
    assert!(!catalogs.contains_key(&broken.id));
    assert_eq!(catalogs[&healthy.id].tools[0].name, "list");

    manager.shutdown().await;
}

#[tokio::test]
async fn discovery_persists_and_falls_back_to_capabilities_cache() {
    let (store, manager) = fixture().await;
    let server = scripted_server("filesystem", "fs");
    store.create_downstream_server(&server).await.unwrap();

    // First discovery snapshots the catalog.
    let catalogs = manager.list_all_tools().await.unwrap();
    assert_eq!(catalogs[&server.id].tools.len(), 1);
    let cached = store.get_downstream_server(&server.id).await.unwrap();
    assert!(cached.capabilities_cache.is_some());
    manager.shutdown().await;

    // Break the command; discovery now serves the cached snapshot.
    let mut broken = cached.clone();
    broken.command = Some("missing-binary-a1b2".to_string());
    store.update_downstream_server(&broken).await.unwrap();

    let catalogs = manager.list_all_tools().await.unwrap();
    assert_eq!(catalogs[&server.id].tools[0].name, "list");

    manager.shutdown().await;
}

#[tokio::test]
async fn http_backend_roundtrip() {
    let (store, manager) = fixture().await;

    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "remote", "version": "1"}
            },
            "id": 1
        })))
        .up_to_n_times(2)
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": {"content": [{"type": "text", "text": "remote-done"}]},
            "id": 2
        })))
        .mount(&mock)
        .await;

    let server = DownstreamServer::http("github", "github", format!("{}/mcp", mock.uri()));
    store.create_downstream_server(&server).await.unwrap();

    let result = manager.call(&server.id, "", "list_prs", json!({"repo": "x"})).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("remote-done"));

    manager.shutdown().await;
}
