//! Error types for gateway sessions and listeners

use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Internal gateway failures; protocol-level problems become JSON-RPC
/// error responses instead.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mcp(#[from] mcplexer_mcp::McpError),

    #[error(transparent)]
    Store(#[from] mcplexer_storage::StoreError),

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl GatewayError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}
