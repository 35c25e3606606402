//! Bridge → socket → session integration
//!
//! Drives a client through the stdio↔socket bridge against a real socket
//! listener, exercising root injection end to end: the client ships no
//! roots, yet its calls route against the workspace the bridge anchored.

use std::sync::Arc;

use mcplexer_approval::ApprovalGate;
use mcplexer_auth::{CredentialInjector, Encryptor, OAuthFlowManager, PlaintextEncryptor};
use mcplexer_gateway::{bridge_streams, run_socket, GatewayContext};
use mcplexer_mcp::DownstreamManager;
use mcplexer_routing::RoutingEngine;
use mcplexer_storage::entities::{DownstreamServer, RoutePolicy, RouteRule, Workspace};
use mcplexer_storage::{SqliteStore, Store};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

const FAKE_STDIO_SERVER: &str = r#"
read line
printf '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}},"id":1}\n'
read notif
while read line; do
  printf '{"jsonrpc":"2.0","result":{"echo":%s},"id":0}\n' "$line"
done
"#;

async fn build_context(store: Arc<SqliteStore>) -> Arc<GatewayContext> {
    let encryptor: Arc<dyn Encryptor> = Arc::new(PlaintextEncryptor);
    let oauth = Arc::new(OAuthFlowManager::new(
        store.clone() as Arc<dyn Store>,
        encryptor.clone(),
        "http://127.0.0.1:8321",
    ));
    let injector = Arc::new(CredentialInjector::new(
        store.clone() as Arc<dyn Store>,
        encryptor,
        oauth.clone(),
    ));
    Arc::new(GatewayContext {
        store: store.clone() as Arc<dyn Store>,
        engine: Arc::new(RoutingEngine::new(store.clone() as Arc<dyn Store>)),
        manager: Arc::new(DownstreamManager::new(store.clone() as Arc<dyn Store>, injector)),
        oauth,
        gate: Arc::new(ApprovalGate::new(store as Arc<dyn Store>)),
    })
}

/// Next response frame, skipping server-initiated notifications
async fn read_response(reader: &mut BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>) -> Value {
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(!line.is_empty(), "stream closed");
        let frame: Value = serde_json::from_str(&line).unwrap();
        if frame.get("id").map_or(true, Value::is_null) && frame.get("method").is_some() {
            continue;
        }
        return frame;
    }
}

#[tokio::test]
async fn rootless_client_is_anchored_by_the_bridge() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());

    // A project workspace with an allow rule, and a deny-by-default global.
    let global = Workspace::new("global", "/", RoutePolicy::Deny);
    store.create_workspace(&global).await.unwrap();
    let project = Workspace::new("project", "/home/u/project", RoutePolicy::Deny);
    store.create_workspace(&project).await.unwrap();

    let server = DownstreamServer::stdio(
        "filesystem",
        "fs",
        "sh",
        vec!["-c".to_string(), FAKE_STDIO_SERVER.to_string()],
    );
    store.create_downstream_server(&server).await.unwrap();

    let mut rule = RouteRule::allow(&project.id, "**", &server.id);
    rule.tool_match = vec!["fs__*".into()];
    store.create_route_rule(&rule).await.unwrap();

    // Daemon on a scratch socket.
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("mcplexer.sock").display().to_string();
    let ctx = build_context(store.clone()).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = {
        let ctx = ctx.clone();
        let socket_path = socket_path.clone();
        tokio::spawn(async move { run_socket(ctx, &socket_path, shutdown_rx).await })
    };
    // Give the listener a moment to bind.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Bridge with the "client" side on an in-memory duplex.
    let (client_side, bridge_side) = tokio::io::duplex(256 * 1024);
    let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
    {
        let socket_path = socket_path.clone();
        tokio::spawn(async move {
            let _ = bridge_streams(bridge_read, bridge_write, &socket_path, "/home/u/project".to_string()).await;
        });
    }

    let (client_read, mut client_write) = tokio::io::split(client_side);
    let mut client_read = BufReader::new(client_read);

    // No roots in initialize; the bridge injects /home/u/project.
    let init = json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "cursor", "version": "1.0"}
        },
        "id": 1
    });
    client_write
        .write_all(format!("{init}\n").as_bytes())
        .await
        .unwrap();

    let reply = read_response(&mut client_read).await;
    assert_eq!(reply["result"]["protocolVersion"], json!("2024-11-05"));

    client_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
        .await
        .unwrap();

    // The call routes in the project workspace only because the bridge
    // anchored the session there.
    let call = json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": {"name": "fs__list", "arguments": {}},
        "id": 2
    });
    client_write.write_all(format!("{call}\n").as_bytes()).await.unwrap();

    let reply = read_response(&mut client_read).await;
    assert_eq!(reply["id"], json!(2));
    assert_eq!(reply["result"]["echo"]["params"]["name"], json!("list"));

    ctx.manager.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = daemon.await;
}
