//! JSON-RPC 2.0 messages and newline-delimited framing

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{McpError, McpResult};

/// JSON-RPC 2.0 version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Frame limit for downstream stdio lines
pub const MAX_STDIO_FRAME: usize = 1024 * 1024;

/// Frame limit for client frames and SSE payloads
pub const MAX_CLIENT_FRAME: usize = 4 * 1024 * 1024;

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0"
    pub jsonrpc: String,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Request with a numeric id (downstream ids come from a counter)
    pub fn with_id(method: impl Into<String>, params: Option<Value>, id: i64) -> Self {
        Self::new(method, params, Some(Value::from(id)))
    }

    /// Notification: no id, no response expected
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(method, params, None)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(result: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(error: JsonRpcError, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unpack into the result value or a downstream error
    pub fn into_result(self) -> McpResult<Value> {
        if let Some(err) = self.error {
            return Err(McpError::Downstream {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(details: impl Into<String>) -> Self {
        Self::new(
            error_codes::PARSE_ERROR,
            "Parse error",
            Some(Value::String(details.into())),
        )
    }

    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            "Invalid Request",
            Some(Value::String(details.into())),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            "Method not found",
            Some(Value::String(format!("Method '{method}' not found"))),
        )
    }

    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            "Invalid params",
            Some(Value::String(details.into())),
        )
    }

    pub fn internal_error(details: impl Into<String>) -> Self {
        Self::new(
            error_codes::INTERNAL_ERROR,
            "Internal error",
            Some(Value::String(details.into())),
        )
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard and application error codes used on the wire
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Application range
    /// Call blocked by routing policy or approval outcome
    pub const BLOCKED: i64 = -32010;
    /// No route matched the call
    pub const NO_ROUTE: i64 = -32011;
    /// Credentials missing or expired; client should drive reauth
    pub const REAUTH_REQUIRED: i64 = -32012;
    /// Downstream transport failed; the call may be retried
    pub const DOWNSTREAM_UNAVAILABLE: i64 = -32013;
}

/// Read one newline-delimited frame, enforcing `limit`.
///
/// Returns `Ok(None)` on clean EOF.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> McpResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = reader.take((limit + 1) as u64);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > limit {
        return Err(McpError::FrameTooLarge {
            size: buf.len(),
            limit,
        });
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8(buf).map_err(|e| McpError::protocol(format!("frame is not utf-8: {e}")))?;
    Ok(Some(line))
}

/// Serialize `message` and write it as one newline-delimited frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> McpResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let request = JsonRpcRequest::with_id("tools/call", Some(json!({"name": "fs__list"})), 7);
        let serialized = serde_json::to_string(&request).unwrap();
        let deserialized: JsonRpcRequest = serde_json::from_str(&serialized).unwrap();
        assert_eq!(request, deserialized);
        assert!(!request.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let n = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(n.is_notification());
        assert!(!serde_json::to_string(&n).unwrap().contains("\"id\""));
    }

    #[test]
    fn response_into_result() {
        let ok = JsonRpcResponse::success(json!({"tools": []}), Some(json!(1)));
        assert_eq!(ok.into_result().unwrap(), json!({"tools": []}));

        let failed = JsonRpcResponse::error(JsonRpcError::new(-32000, "boom", None), Some(json!(2)));
        match failed.into_result().unwrap_err() {
            McpError::Downstream { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        let request = JsonRpcRequest::with_id("ping", None, 1);
        write_frame(&mut buf, &request).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let line = read_frame(&mut reader, MAX_STDIO_FRAME).await.unwrap().unwrap();
        let parsed: JsonRpcRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, request);

        // Next read is clean EOF
        assert!(read_frame(&mut reader, MAX_STDIO_FRAME).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let huge = format!("{}\n", "x".repeat(64));
        let mut reader = tokio::io::BufReader::new(huge.as_bytes());
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, McpError::FrameTooLarge { .. }));
    }
}
