//! Error types for downstream MCP operations

use std::time::Duration;
use thiserror::Error;

/// Result type for downstream MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Errors raised by instances and the instance pool
#[derive(Error, Debug)]
pub enum McpError {
    /// Transport-level failure: broken pipe, dead child, network error
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Downstream process or endpoint could not be reached or spawned
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// A deadline elapsed (handshake, request, shutdown)
    #[error("Timed out after {timeout:?}: {operation}")]
    Timeout { operation: String, timeout: Duration },

    /// The downstream returned HTTP 401; callers may refresh credentials
    /// and retry once
    #[error("Authentication required: {message}")]
    AuthRequired { message: String },

    /// JSON-RPC error object returned by the downstream, forwarded verbatim
    #[error("Downstream error {code}: {message}")]
    Downstream {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Malformed frame or response
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A frame exceeded the configured size limit
    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// Server definition problems: disabled, missing command/url
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The request was cancelled before a response arrived
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    /// (De)serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Credential resolution failed
    #[error("Credential error: {message}")]
    Credential { message: String },

    /// Store failure while loading server definitions
    #[error("Store error: {message}")]
    Store { message: String },
}

impl McpError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::AuthRequired {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Whether a fresh attempt on a new instance could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ConnectionFailed { .. } | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: "http request".to_string(),
                timeout: Duration::from_secs(60),
            }
        } else if err.is_connect() {
            Self::ConnectionFailed {
                reason: err.to_string(),
            }
        } else {
            Self::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<mcplexer_storage::StoreError> for McpError {
    fn from(err: mcplexer_storage::StoreError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}
