//! Auth scope entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordSource;

/// The kind of credential bundle a scope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Static key/value pairs injected as child environment variables
    Env,
    /// Static key/value pairs injected as HTTP headers
    Header,
    /// OAuth2 access token minted from a provider
    Oauth2,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Header => "header",
            Self::Oauth2 => "oauth2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "env" => Some(Self::Env),
            "header" => Some(Self::Header),
            "oauth2" => Some(Self::Oauth2),
            _ => None,
        }
    }
}

/// A named credential bundle referenced by route rules.
///
/// For `env`/`header` scopes, `encrypted_data` holds an encrypted JSON
/// object `{key: value}`. For `oauth2` scopes, `oauth_token_data` holds an
/// encrypted token bundle and `oauth_provider_id` names the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthScope {
    pub id: String,
    pub name: String,
    pub scope_type: ScopeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_provider_id: Option<String>,

    /// Encrypted `{key: value}` object for env/header scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<Vec<u8>>,

    /// Encrypted OAuth token bundle for oauth2 scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_data: Option<Vec<u8>>,

    #[serde(default)]
    pub source: RecordSource,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthScope {
    pub fn new(name: impl Into<String>, scope_type: ScopeKind) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.into(),
            scope_type,
            oauth_provider_id: None,
            encrypted_data: None,
            oauth_token_data: None,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }
}
