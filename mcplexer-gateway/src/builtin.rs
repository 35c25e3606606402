//! Built-in control and diagnostics tools
//!
//! Exposed under the reserved `mcpx` namespace from the virtual
//! "mcpx-builtin" server; handlers run in-process and never touch the
//! instance pool routing path.

use serde_json::{json, Value};

use mcplexer_mcp::protocol::{JsonRpcError, ToolDef};

use crate::context::GatewayContext;

/// Reserved namespace for built-in tools
pub const BUILTIN_NAMESPACE: &str = "mcpx";

/// Tool names as they appear in the aggregated catalog
pub const STATUS_TOOL: &str = "mcpx__status";
pub const LIST_WORKSPACES_TOOL: &str = "mcpx__list_workspaces";
pub const PING_DOWNSTREAM_TOOL: &str = "mcpx__ping_downstream";

/// Whether a namespaced tool name belongs to the builtin server
pub fn is_builtin(tool_name: &str) -> bool {
    tool_name
        .split_once("__")
        .is_some_and(|(namespace, _)| namespace == BUILTIN_NAMESPACE)
}

/// Catalog entries for the builtin tools
pub fn builtin_tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: STATUS_TOOL.to_string(),
            description: Some("Gateway status: instance pool, route cache, audit rollup".to_string()),
            input_schema: Some(json!({"type": "object", "properties": {}})),
        },
        ToolDef {
            name: LIST_WORKSPACES_TOOL.to_string(),
            description: Some("List configured workspaces and their default policies".to_string()),
            input_schema: Some(json!({"type": "object", "properties": {}})),
        },
        ToolDef {
            name: PING_DOWNSTREAM_TOOL.to_string(),
            description: Some("Start (if needed) and ping a downstream server by name".to_string()),
            input_schema: Some(json!({
                "type": "object",
                "properties": {"server": {"type": "string"}},
                "required": ["server"]
            })),
        },
    ]
}

/// Dispatch one builtin call
pub async fn handle(ctx: &GatewayContext, tool_name: &str, args: &Value) -> Result<Value, JsonRpcError> {
    match tool_name {
        STATUS_TOOL => status(ctx).await,
        LIST_WORKSPACES_TOOL => list_workspaces(ctx).await,
        PING_DOWNSTREAM_TOOL => ping_downstream(ctx, args).await,
        other => Err(JsonRpcError::method_not_found(other)),
    }
}

async fn status(ctx: &GatewayContext) -> Result<Value, JsonRpcError> {
    let instances: Vec<Value> = ctx
        .manager
        .instance_infos()
        .await
        .into_iter()
        .map(|info| json!({"key": info.key.to_string(), "state": info.state.as_str()}))
        .collect();

    let cache = ctx.engine.cache_stats();

    let aggregates = ctx
        .store
        .audit_aggregates(&Default::default())
        .await
        .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;
    let audit: Vec<Value> = aggregates
        .into_iter()
        .map(|a| {
            json!({
                "server_id": a.server_id,
                "calls": a.calls,
                "errors": a.errors,
                "blocked": a.blocked,
                "avg_latency_ms": a.avg_latency_ms,
            })
        })
        .collect();

    Ok(tool_text_result(&json!({
        "instances": instances,
        "route_cache": {"hits": cache.hits, "misses": cache.misses},
        "audit": audit,
    })))
}

async fn list_workspaces(ctx: &GatewayContext) -> Result<Value, JsonRpcError> {
    let workspaces = ctx
        .store
        .list_workspaces()
        .await
        .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;
    let listed: Vec<Value> = workspaces
        .into_iter()
        .map(|w| {
            json!({
                "id": w.id,
                "name": w.name,
                "root_path": w.root_path,
                "default_policy": w.default_policy.as_str(),
            })
        })
        .collect();
    Ok(tool_text_result(&json!({ "workspaces": listed })))
}

async fn ping_downstream(ctx: &GatewayContext, args: &Value) -> Result<Value, JsonRpcError> {
    let name = args
        .get("server")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("missing 'server'"))?;
    let server = ctx
        .store
        .get_downstream_server_by_name(name)
        .await
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

    let outcome = match ctx.manager.get_or_start(&server.id, "").await {
        Ok(instance) => match instance.request("ping", None, None).await {
            Ok(_) => json!({"server": name, "ok": true}),
            // Some servers don't implement ping; reaching them is enough
            Err(mcplexer_mcp::McpError::Downstream { .. }) => json!({"server": name, "ok": true}),
            Err(e) => json!({"server": name, "ok": false, "error": e.to_string()}),
        },
        Err(e) => json!({"server": name, "ok": false, "error": e.to_string()}),
    };
    Ok(tool_text_result(&outcome))
}

/// Wrap a JSON payload in MCP tool-result content
fn tool_text_result(payload: &Value) -> Value {
    json!({
        "content": [{"type": "text", "text": payload.to_string()}]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_detection() {
        assert!(is_builtin("mcpx__status"));
        assert!(!is_builtin("fs__list"));
        assert!(!is_builtin("status"));
    }

    #[test]
    fn defs_are_namespaced() {
        for def in builtin_tool_defs() {
            assert!(def.name.starts_with("mcpx__"), "{} not namespaced", def.name);
        }
    }
}
