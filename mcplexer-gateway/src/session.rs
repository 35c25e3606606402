//! Per-client gateway session
//!
//! Owns one duplex byte stream speaking newline-delimited JSON-RPC. A
//! single writer task serializes everything going to the client; the read
//! loop dispatches each request onto its own task so a slow `tools/call`
//! never head-of-line-blocks `ping` or `tools/list`. Client request ids are
//! preserved verbatim in responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use mcplexer_approval::{ApprovalOutcome, ApprovalRequest};
use mcplexer_mcp::protocol::{
    error_codes, methods, read_frame, Implementation, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ToolDef, ToolsCallParams, ToolsCapability, ToolsListResult,
    MAX_CLIENT_FRAME, PROTOCOL_VERSION,
};
use mcplexer_mcp::McpError;
use mcplexer_routing::{RouteContext, RouteDecision, RouteError};
use mcplexer_storage::entities::{AuditRecord, AuditStatus, SessionRecord};

use crate::audit::{emit, redact_params};
use crate::builtin;
use crate::context::GatewayContext;
use crate::error::GatewayResult;
use crate::workspace::{resolve_ancestors, root_uri_to_path, Ancestor};

/// Default wait when a rule requires approval but sets no timeout
const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

struct SessionShared {
    ctx: Arc<GatewayContext>,
    session_id: String,
    out: mpsc::UnboundedSender<String>,
    ancestors: RwLock<Vec<Ancestor>>,
    model_hint: RwLock<Option<String>>,
    cancel_rx: watch::Receiver<bool>,
}

impl SessionShared {
    fn respond(&self, response: JsonRpcResponse) {
        match serde_json::to_string(&response) {
            Ok(frame) => {
                let _ = self.out.send(frame);
            }
            Err(e) => warn!(session = %self.session_id, error = %e, "failed to serialize response"),
        }
    }

    fn respond_result(&self, id: Option<Value>, result: Value) {
        self.respond(JsonRpcResponse::success(result, id));
    }

    fn respond_error(&self, id: Option<Value>, error: JsonRpcError) {
        self.respond(JsonRpcResponse::error(error, id));
    }

    /// Queue a server-initiated notification on the writer. Delivery order
    /// matches submission order because everything rides the same channel.
    fn notify(&self, method: &str, params: Option<Value>) {
        let notification = JsonRpcRequest::notification(method, params);
        match serde_json::to_string(&notification) {
            Ok(frame) => {
                let _ = self.out.send(frame);
            }
            Err(e) => warn!(session = %self.session_id, error = %e, "failed to serialize notification"),
        }
    }

    /// Future that resolves when the session is closing
    fn closed(&self) -> impl std::future::Future<Output = ()> + Send {
        let mut rx = self.cancel_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    }
}

/// Run one session to completion over an arbitrary byte stream.
///
/// Returns after clean EOF or a fatal framing error. Closing a session
/// never stops downstream instances; they are manager-owned and shared.
pub async fn run_session<R, W>(ctx: Arc<GatewayContext>, reader: R, writer: W) -> GatewayResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let record = SessionRecord::new();
    let session_id = record.id.clone();
    ctx.store.create_session(&record).await?;
    info!(session = %session_id, "session connected");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_loop(writer, out_rx));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let shared = Arc::new(SessionShared {
        ctx: ctx.clone(),
        session_id: session_id.clone(),
        out: out_tx,
        ancestors: RwLock::new(Vec::new()),
        model_hint: RwLock::new(None),
        cancel_rx,
    });

    let mut reader = BufReader::new(reader);
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        // Reap finished request tasks as we go
        while tasks.try_join_next().is_some() {}

        let frame = match read_frame(&mut reader, MAX_CLIENT_FRAME).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                // Oversized or broken frame: the stream is unrecoverable
                warn!(session = %session_id, error = %e, "closing session on framing error");
                shared.respond_error(None, JsonRpcError::invalid_request(e.to_string()));
                break;
            }
        };

        let request: JsonRpcRequest = match serde_json::from_str(&frame) {
            Ok(request) => request,
            Err(e) => {
                shared.respond_error(None, JsonRpcError::parse_error(e.to_string()));
                continue;
            }
        };

        match request.method.as_str() {
            methods::INITIALIZE => {
                handle_initialize(&shared, request).await;
            }
            methods::PING => {
                shared.respond_result(request.id, json!({}));
            }
            _ if request.is_notification() => {
                debug!(session = %session_id, method = %request.method, "notification ignored");
            }
            methods::TOOLS_LIST => {
                let shared = shared.clone();
                tasks.spawn(async move {
                    let id = request.id.clone();
                    match aggregate_tools(&shared).await {
                        Ok(result) => shared.respond_result(id, serde_json::to_value(result).unwrap_or(Value::Null)),
                        Err(error) => shared.respond_error(id, error),
                    }
                });
            }
            methods::TOOLS_CALL => {
                let shared = shared.clone();
                tasks.spawn(async move {
                    let id = request.id.clone();
                    match handle_tools_call(&shared, request.params.unwrap_or(Value::Null)).await {
                        Ok(result) => shared.respond_result(id, result),
                        Err(error) => shared.respond_error(id, error),
                    }
                });
            }
            other => {
                shared.respond_error(request.id, JsonRpcError::method_not_found(other));
            }
        }
    }

    // Close: cancel in-flight work, mark disconnected, release resources.
    let _ = cancel_tx.send(true);
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    if let Err(e) = ctx.store.close_session(&session_id, Utc::now()).await {
        warn!(session = %session_id, error = %e, "failed to close session record");
    }
    drop(shared);
    let _ = writer_task.await;
    info!(session = %session_id, "session disconnected");
    Ok(())
}

/// The single writer: everything to the client goes through here
async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if writer.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

async fn handle_initialize(shared: &Arc<SessionShared>, request: JsonRpcRequest) {
    let id = request.id.clone();
    let params: Option<InitializeParams> = request.params.and_then(|p| serde_json::from_value(p).ok());

    let mut record_update: Option<SessionRecord> = None;
    if let Ok(mut record) = shared.ctx.store.get_session(&shared.session_id).await {
        if let Some(params) = &params {
            record.client_type = Some(params.client_info.name.clone());
            record.model_hint = params.model_hint.clone();
        }
        record_update = Some(record);
    }
    if let Some(params) = &params {
        *shared.model_hint.write().await = params.model_hint.clone();
    }

    // The first root anchors the workspace ancestor chain
    let client_root = params
        .as_ref()
        .and_then(|p| p.roots.as_ref())
        .and_then(|roots| roots.first())
        .and_then(|root| root_uri_to_path(&root.uri));

    match resolve_ancestors(&shared.ctx.store, client_root.as_deref()).await {
        Ok(chain) => {
            if let (Some(record), Some(nearest)) = (record_update.as_mut(), chain.first()) {
                record.workspace_id = Some(nearest.workspace_id.clone());
            }
            *shared.ancestors.write().await = chain;
        }
        Err(e) => warn!(session = %shared.session_id, error = %e, "workspace resolution failed"),
    }

    if let Some(record) = record_update {
        if let Err(e) = shared.ctx.store.update_session(&record).await {
            warn!(session = %shared.session_id, error = %e, "failed to update session record");
        }
    }

    let result = InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
        },
        server_info: Implementation::gateway(),
    };
    shared.respond_result(id, serde_json::to_value(result).unwrap_or(Value::Null));

    // Warm downstream catalogs in the background; tools/list will reuse
    // the capabilities caches this fills. Clients that listed tools before
    // the fan-out finished get nudged to list again.
    let shared = shared.clone();
    tokio::spawn(async move {
        match shared.ctx.manager.list_all_tools().await {
            Ok(catalogs) => {
                debug!(session = %shared.session_id, servers = catalogs.len(), "discovery warmup complete");
                if !catalogs.is_empty() {
                    shared.notify(methods::TOOLS_LIST_CHANGED, None);
                }
            }
            Err(e) => warn!(session = %shared.session_id, error = %e, "discovery warmup failed"),
        }
    });
}

/// Union of downstream catalogs, renamed `<namespace>__<tool>`, plus the
/// builtin tools. Disabled servers never appear.
async fn aggregate_tools(shared: &Arc<SessionShared>) -> Result<ToolsListResult, JsonRpcError> {
    let ctx = &shared.ctx;
    let catalogs = ctx
        .manager
        .list_all_tools()
        .await
        .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;
    let servers = ctx
        .store
        .list_downstream_servers()
        .await
        .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;

    let namespaces: HashMap<&str, &str> = servers
        .iter()
        .map(|s| (s.id.as_str(), s.tool_namespace.as_str()))
        .collect();

    let mut tools: Vec<ToolDef> = Vec::new();
    for (server_id, catalog) in &catalogs {
        let Some(namespace) = namespaces.get(server_id.as_str()) else {
            continue;
        };
        for tool in &catalog.tools {
            tools.push(ToolDef {
                name: format!("{namespace}__{}", tool.name),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            });
        }
    }
    tools.extend(builtin::builtin_tool_defs());
    tools.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ToolsListResult {
        tools,
        next_cursor: None,
    })
}

/// The full tools/call pipeline: route, approve, authenticate, dispatch,
/// audit.
async fn handle_tools_call(shared: &Arc<SessionShared>, params: Value) -> Result<Value, JsonRpcError> {
    let started = Instant::now();
    let ctx = &shared.ctx;

    let call: ToolsCallParams =
        serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
    let args = call.arguments.clone().unwrap_or_else(|| json!({}));

    // Built-in tools short-circuit routing entirely
    if builtin::is_builtin(&call.name) {
        let result = builtin::handle(ctx, &call.name, &args).await?;
        let mut record = AuditRecord::new(&call.name, AuditStatus::Success);
        record.session_id = Some(shared.session_id.clone());
        record.latency_ms = started.elapsed().as_millis() as i64;
        emit(ctx.store.as_ref(), record).await;
        return Ok(result);
    }

    let Some((_, bare_tool)) = call.name.split_once("__") else {
        return Err(JsonRpcError::invalid_params(format!(
            "tool name {:?} is not namespaced as <server>__<tool>",
            call.name
        )));
    };

    // Route across the ancestor chain
    let ancestors = shared.ancestors.read().await.clone();
    let route_ctxs: Vec<RouteContext> = ancestors
        .iter()
        .map(|ancestor| RouteContext {
            workspace_id: ancestor.workspace_id.clone(),
            subpath: ancestor.subpath.clone(),
            tool_name: call.name.clone(),
        })
        .collect();

    let decision = match ctx.engine.route_with_fallback(&route_ctxs).await {
        Ok(decision) => decision,
        Err(RouteError::Denied { rule_id }) => {
            let mut record = blocked_record(shared, &call, "denied by rule");
            record.matched_rule_id = Some(rule_id.clone());
            emit(ctx.store.as_ref(), record).await;
            return Err(JsonRpcError::new(
                error_codes::BLOCKED,
                "Call blocked by routing policy",
                Some(json!({"rule_id": rule_id})),
            ));
        }
        Err(RouteError::NoRoute) => {
            emit(ctx.store.as_ref(), blocked_record(shared, &call, "no route")).await;
            return Err(JsonRpcError::new(
                error_codes::NO_ROUTE,
                format!("No route for tool '{}'", call.name),
                None,
            ));
        }
        Err(RouteError::Store(e)) => {
            return Err(JsonRpcError::internal_error(e.to_string()));
        }
    };

    // Human approval, when the matched rule demands it
    if decision.requires_approval {
        let outcome = ctx
            .gate
            .request_approval(
                ApprovalRequest {
                    tool_name: call.name.clone(),
                    workspace_id: Some(decision.workspace_id.clone()),
                    server_id: Some(decision.downstream_server_id.clone()),
                    model_hint: shared.model_hint.read().await.clone(),
                    params_summary: Some(redact_params(&args).to_string()),
                    timeout: decision
                        .approval_timeout_sec
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_APPROVAL_TIMEOUT),
                },
                shared.closed(),
            )
            .await
            .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;

        if !outcome.is_approved() {
            let mut record = blocked_record(shared, &call, outcome.blocked_reason());
            record.workspace_id = Some(decision.workspace_id.clone());
            record.server_id = Some(decision.downstream_server_id.clone());
            record.matched_rule_id = Some(decision.matched_rule_id.clone());
            emit(ctx.store.as_ref(), record).await;
            let reason = match &outcome {
                ApprovalOutcome::Denied { reason, .. } => reason.clone(),
                _ => None,
            };
            return Err(JsonRpcError::new(
                error_codes::BLOCKED,
                format!("Approval {}", outcome.blocked_reason()),
                reason.map(|r| json!({"reason": r})),
            ));
        }
    }

    // Dispatch, with a single refresh-and-retry on 401 for oauth2 scopes
    let scope_id = decision.auth_scope_id.clone().unwrap_or_default();
    let outcome = dispatch_with_reauth(shared, &decision, &scope_id, bare_tool, &args).await;

    let latency_ms = started.elapsed().as_millis() as i64;
    match outcome {
        Ok(result) => {
            let mut record = AuditRecord::new(&call.name, AuditStatus::Success);
            record.session_id = Some(shared.session_id.clone());
            record.workspace_id = Some(decision.workspace_id.clone());
            record.server_id = Some(decision.downstream_server_id.clone());
            record.matched_rule_id = Some(decision.matched_rule_id.clone());
            record.latency_ms = latency_ms;
            record.response_bytes = serde_json::to_vec(&result).ok().map(|b| b.len() as i64);
            record.params_redacted = Some(redact_params(&args));
            record.cache_hit = decision.cache_hit;
            emit(ctx.store.as_ref(), record).await;
            Ok(result)
        }
        Err(error) => {
            let rpc_error = mcp_error_to_rpc(&error, &scope_id);
            let mut record = AuditRecord::new(&call.name, AuditStatus::Error);
            record.session_id = Some(shared.session_id.clone());
            record.workspace_id = Some(decision.workspace_id.clone());
            record.server_id = Some(decision.downstream_server_id.clone());
            record.matched_rule_id = Some(decision.matched_rule_id.clone());
            record.latency_ms = latency_ms;
            record.error_code = Some(rpc_error.code);
            record.error_message = Some(rpc_error.message.clone());
            record.params_redacted = Some(redact_params(&args));
            record.cache_hit = decision.cache_hit;
            emit(ctx.store.as_ref(), record).await;
            Err(rpc_error)
        }
    }
}

async fn dispatch_with_reauth(
    shared: &Arc<SessionShared>,
    decision: &RouteDecision,
    scope_id: &str,
    bare_tool: &str,
    args: &Value,
) -> Result<Value, McpError> {
    let ctx = &shared.ctx;
    let first = ctx
        .manager
        .call(&decision.downstream_server_id, scope_id, bare_tool, args.clone())
        .await;

    match first {
        Err(McpError::AuthRequired { .. }) if !scope_id.is_empty() => {
            debug!(scope_id, "downstream rejected credentials, refreshing once");
            ctx.oauth
                .refresh_token(scope_id)
                .await
                .map_err(|e| McpError::AuthRequired { message: e.to_string() })?;
            ctx.manager
                .call(&decision.downstream_server_id, scope_id, bare_tool, args.clone())
                .await
        }
        other => other,
    }
}

fn blocked_record(shared: &Arc<SessionShared>, call: &ToolsCallParams, reason: &str) -> AuditRecord {
    let mut record = AuditRecord::new(&call.name, AuditStatus::Blocked);
    record.session_id = Some(shared.session_id.clone());
    record.blocked_reason = Some(reason.to_string());
    record.params_redacted = call.arguments.as_ref().map(redact_params);
    record
}

/// Map downstream failures onto wire errors. Downstream application errors
/// forward verbatim; auth failures carry the scope id so the client can
/// drive reauthorization.
fn mcp_error_to_rpc(error: &McpError, scope_id: &str) -> JsonRpcError {
    match error {
        McpError::Downstream { code, message, data } => JsonRpcError::new(*code, message.clone(), data.clone()),
        McpError::AuthRequired { message } => JsonRpcError::new(
            error_codes::REAUTH_REQUIRED,
            "Reauthorization required",
            Some(json!({"auth_scope_id": scope_id, "detail": message})),
        ),
        other => JsonRpcError::new(
            error_codes::DOWNSTREAM_UNAVAILABLE,
            other.to_string(),
            Some(json!({"retryable": other.is_retryable()})),
        ),
    }
}
