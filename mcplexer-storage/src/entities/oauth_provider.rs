//! OAuth2 provider definition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordSource;

/// An OAuth2 authorization server an auth scope can mint tokens from.
///
/// `client_secret_enc` is opaque encrypted bytes; the store never sees the
/// plaintext secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthProvider {
    pub id: String,

    /// Unique provider name
    pub name: String,

    /// Built-in well-known template this provider was created from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,

    /// Encrypted client secret; empty for public clients
    #[serde(default)]
    pub client_secret_enc: Vec<u8>,

    /// Scopes requested during authorization
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Whether the authorization-code flow uses PKCE S256
    pub use_pkce: bool,

    #[serde(default)]
    pub source: RecordSource,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthProvider {
    pub fn new(
        name: impl Into<String>,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.into(),
            template_id: None,
            authorize_url: authorize_url.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret_enc: Vec::new(),
            scopes: Vec::new(),
            use_pkce: true,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }
}
