//! HTTP instance: MCP Streamable HTTP client
//!
//! Each request is one POST; the response body is either a plain JSON-RPC
//! response or an SSE stream whose `data:` lines carry JSON-RPC responses.
//! The `Mcp-Session-Id` header returned on `initialize` is echoed on every
//! subsequent request. There is no client-side queue; concurrency is
//! bounded only by the HTTP client.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{
    messages::methods, InitializeParams, JsonRpcRequest, JsonRpcResponse, MAX_CLIENT_FRAME,
};

use super::{DownstreamInstance, HeaderOverlay, InstanceKey, InstanceState, StateCell};

/// Default deadline for one HTTP round trip
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// A downstream reached over MCP Streamable HTTP
pub struct HttpInstance {
    key: InstanceKey,
    url: String,
    /// Credential headers resolved when the instance was created; callers
    /// may override per request after a token refresh.
    base_headers: HeaderOverlay,
    client: reqwest::Client,
    session_id: StdMutex<Option<String>>,
    state: Arc<StateCell>,
    next_id: AtomicI64,
    last_activity: Arc<StdMutex<Instant>>,
    idle_timeout: Duration,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl HttpInstance {
    pub fn new(key: InstanceKey, url: impl Into<String>, base_headers: HeaderOverlay, idle_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            key,
            url: url.into(),
            base_headers,
            client,
            session_id: StdMutex::new(None),
            state: Arc::new(StateCell::new(InstanceState::Stopped)),
            next_id: AtomicI64::new(1),
            last_activity: Arc::new(StdMutex::new(Instant::now())),
            idle_timeout,
            watchdog: Mutex::new(None),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity clock poisoned") = Instant::now();
    }

    fn build_headers(&self, overlay: Option<&HeaderOverlay>) -> McpResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));

        let mut insert = |key: &str, value: &str| -> McpResult<()> {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::configuration(format!("bad header name {key:?}: {e}")))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| McpError::configuration(format!("bad header value: {e}")))?;
            headers.insert(name, value);
            Ok(())
        };

        for (key, value) in &self.base_headers {
            insert(key, value)?;
        }
        if let Some(overlay) = overlay {
            for (key, value) in overlay {
                insert(key, value)?;
            }
        }
        if let Some(session) = self.session_id.lock().expect("session id poisoned").clone() {
            headers.insert(
                HeaderName::from_static(MCP_SESSION_HEADER),
                HeaderValue::from_str(&session)
                    .map_err(|e| McpError::protocol(format!("bad session id from server: {e}")))?,
            );
        }
        Ok(headers)
    }

    /// POST one message and decode the response by content type
    async fn post(&self, message: &JsonRpcRequest, overlay: Option<&HeaderOverlay>) -> McpResult<Value> {
        let headers = self.build_headers(overlay)?;
        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .json(message)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::auth_required(format!("{} returned 401", self.url)));
        }
        if response.status() == StatusCode::ACCEPTED {
            return Ok(Value::Null);
        }
        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        // Capture the session id handed out on initialize
        if let Some(session) = response.headers().get(MCP_SESSION_HEADER) {
            if let Ok(session) = session.to_str() {
                *self.session_id.lock().expect("session id poisoned") = Some(session.to_string());
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            return decode_sse(response).await;
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        let parsed: JsonRpcResponse = serde_json::from_slice(&body)?;
        if parsed.id.is_none() && parsed.result.is_none() && parsed.error.is_none() {
            return Ok(Value::Null);
        }
        parsed.into_result()
    }
}

/// Scan `data:` lines for the first JSON-RPC response carrying a result or
/// an error.
async fn decode_sse(response: reqwest::Response) -> McpResult<Value> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() > MAX_CLIENT_FRAME {
            return Err(McpError::FrameTooLarge {
                size: buffer.len(),
                limit: MAX_CLIENT_FRAME,
            });
        }

        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(data) {
                Ok(parsed) if parsed.result.is_some() || parsed.error.is_some() => {
                    return parsed.into_result();
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("skipping unparseable SSE data line: {e}");
                    continue;
                }
            }
        }
    }

    Err(McpError::protocol("event stream ended without a response"))
}

#[async_trait]
impl DownstreamInstance for HttpInstance {
    async fn start(&self) -> McpResult<()> {
        let mut watchdog = self.watchdog.lock().await;
        if watchdog.is_some() && self.state.get() != InstanceState::Stopped {
            return Ok(());
        }
        self.state.set(InstanceState::Starting);

        let init_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let init = JsonRpcRequest::with_id(
            methods::INITIALIZE,
            Some(serde_json::to_value(InitializeParams::for_downstream())?),
            init_id,
        );
        if let Err(e) = self.post(&init, None).await {
            self.state.set(InstanceState::Stopped);
            return Err(e);
        }

        let initialized = JsonRpcRequest::notification(methods::INITIALIZED, None);
        if let Err(e) = self.post(&initialized, None).await {
            self.state.set(InstanceState::Stopped);
            return Err(e);
        }

        self.state.set(InstanceState::Ready);
        self.touch();

        // Idle watchdog mirrors the stdio pump's idle timer
        let state = self.state.clone();
        let last_activity = self.last_activity.clone();
        let idle_timeout = self.idle_timeout;
        let key = self.key.clone();
        *watchdog = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(idle_timeout).await;
                let idle_for = last_activity.lock().expect("activity clock poisoned").elapsed();
                let current = state.get();
                if current == InstanceState::Stopped || current == InstanceState::Stopping {
                    break;
                }
                if idle_for >= idle_timeout && current != InstanceState::Busy {
                    debug!(instance = %key, "http session idle, releasing");
                    state.set(InstanceState::Stopped);
                    break;
                }
            }
        }));

        debug!(instance = %self.key, url = %self.url, "http instance started");
        Ok(())
    }

    async fn stop(&self) -> McpResult<()> {
        self.state.set(InstanceState::Stopping);
        if let Some(watchdog) = self.watchdog.lock().await.take() {
            watchdog.abort();
        }
        *self.session_id.lock().expect("session id poisoned") = None;
        self.state.set(InstanceState::Stopped);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>, headers: Option<&HeaderOverlay>) -> McpResult<Value> {
        if self.state.get() == InstanceState::Stopped {
            return Err(McpError::transport("instance is not running"));
        }

        let message = if method.starts_with("notifications/") {
            JsonRpcRequest::notification(method, params)
        } else {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            JsonRpcRequest::with_id(method, params, id)
        };

        self.state.set(InstanceState::Busy);
        let outcome = self.post(&message, headers).await;
        self.touch();
        self.state.set(InstanceState::Idle);

        if let Err(ref e) = outcome {
            if e.is_retryable() {
                warn!(instance = %self.key, error = %e, "http transport failed");
                self.state.set(InstanceState::Stopped);
            }
        }
        outcome
    }

    fn state(&self) -> InstanceState {
        self.state.get()
    }

    fn key(&self) -> &InstanceKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method as http_method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn init_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "remote", "version": "1"}
            },
            "id": 1
        })
    }

    async fn started_instance(server: &MockServer) -> HttpInstance {
        let instance = HttpInstance::new(
            InstanceKey::anonymous("remote"),
            format!("{}/mcp", server.uri()),
            HeaderOverlay::new(),
            Duration::from_secs(60),
        );
        instance.start().await.unwrap();
        instance
    }

    #[tokio::test]
    async fn initialize_captures_session_id() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-42")
                    .set_body_json(init_body()),
            )
            .mount(&server)
            .await;

        let instance = started_instance(&server).await;
        assert_eq!(instance.state(), InstanceState::Ready);

        // The captured session id must be echoed on the next request.
        server.reset().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "result": {"pong": true}, "id": 2
            })))
            .mount(&server)
            .await;

        let result = instance.request("ping", None, None).await.unwrap();
        assert_eq!(result, json!({"pong": true}));
    }

    #[tokio::test]
    async fn sse_body_yields_first_response_with_result() {
        let server = MockServer::start().await;
        let sse = concat!(
            ": comment\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"result\":{\"tools\":[]},\"id\":2}\n",
            "\n",
        );
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(init_body()),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        let instance = started_instance(&server).await;

        server.reset().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let result = instance.request("tools/list", None, None).await.unwrap();
        assert_eq!(result, json!({"tools": []}));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_required() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(init_body()))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        let instance = started_instance(&server).await;

        server.reset().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = instance.request("tools/call", Some(json!({"name": "x"})), None).await;
        assert!(matches!(err.unwrap_err(), McpError::AuthRequired { .. }));
    }

    #[tokio::test]
    async fn overlay_headers_override_base() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(init_body()))
            .up_to_n_times(2)
            .mount(&server)
            .await;

        let mut base = HeaderOverlay::new();
        base.insert("Authorization".to_string(), "Bearer stale".to_string());
        let instance = HttpInstance::new(
            InstanceKey::new("remote", "scope"),
            format!("{}/mcp", server.uri()),
            base,
            Duration::from_secs(60),
        );
        instance.start().await.unwrap();

        server.reset().await;
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "result": {}, "id": 2
            })))
            .mount(&server)
            .await;

        let mut overlay = HeaderOverlay::new();
        overlay.insert("Authorization".to_string(), "Bearer fresh".to_string());
        instance.request("ping", None, Some(&overlay)).await.unwrap();
    }

    #[tokio::test]
    async fn notification_accepts_202_with_no_body() {
        let server = MockServer::start().await;
        let received: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = received.clone();
        Mock::given(http_method("POST"))
            .and(path("/mcp"))
            .respond_with(move |req: &Request| {
                let body = String::from_utf8_lossy(&req.body).to_string();
                seen.lock().unwrap().push(body.clone());
                if body.contains("notifications/initialized") {
                    ResponseTemplate::new(202)
                } else {
                    ResponseTemplate::new(200).set_body_json(init_body())
                }
            })
            .mount(&server)
            .await;

        let instance = started_instance(&server).await;
        assert_eq!(instance.state(), InstanceState::Ready);
        assert_eq!(received.lock().unwrap().len(), 2);
    }
}
