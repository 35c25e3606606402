//! Error types for credential and OAuth operations

use thiserror::Error;

/// Result type for credential and OAuth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors raised by the encryptor, the OAuth flow manager, and the injector
#[derive(Error, Debug)]
pub enum AuthError {
    /// Encryption or decryption failed (wrong key, corrupt bytes)
    #[error("Crypto error: {message}")]
    Crypto { message: String },

    /// The scope is not an oauth2 scope or is missing its provider
    #[error("Scope misconfigured: {message}")]
    ScopeMisconfigured { message: String },

    /// No token stored on the scope; the user must authorize first
    #[error("No token stored for scope {scope_id}")]
    NoToken { scope_id: String },

    /// The token endpoint rejected the request
    #[error("Token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    /// A refresh attempt failed; callers surface this rather than looping
    #[error("Token refresh failed for scope {scope_id}: {message}")]
    RefreshFailed { scope_id: String, message: String },

    /// Authorization state token is unknown or was already consumed
    #[error("Unknown or already-used state token")]
    UnknownState,

    /// Authorization state token outlived its TTL
    #[error("State token expired")]
    StateExpired,

    /// Authorize or discovery URL failed validation
    #[error("Invalid URL: {message}")]
    InvalidUrl { message: String },

    /// Discovery document missing a required field
    #[error("Discovery failed: {message}")]
    Discovery { message: String },

    /// Network failure talking to the provider
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token bundle or credential map (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store failure
    #[error(transparent)]
    Store(#[from] mcplexer_storage::StoreError),
}

impl AuthError {
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    pub fn scope_misconfigured(message: impl Into<String>) -> Self {
        Self::ScopeMisconfigured {
            message: message.into(),
        }
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            message: message.into(),
        }
    }
}
