//! OAuth token bundle stored (encrypted) on auth scopes

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Refresh when less than this much lifetime remains
pub const REFRESH_SKEW: Duration = Duration::minutes(5);

/// The decrypted contents of an auth scope's `oauth_token_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// `None` means the token never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenBundle {
    /// Whether the token has passed its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Whether the token is inside the pre-expiry refresh window
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at - now < REFRESH_SKEW)
    }
}

/// Lifecycle summary surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// No token stored
    None,
    Valid,
    Expired,
    RefreshNeeded,
}

/// `token_status` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub state: TokenState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenStatus {
    pub fn none() -> Self {
        Self {
            state: TokenState::None,
            expires_at: None,
        }
    }

    /// Classify a stored bundle at time `now`
    pub fn of(bundle: &TokenBundle, now: DateTime<Utc>) -> Self {
        let state = if bundle.is_expired(now) {
            TokenState::Expired
        } else if bundle.needs_refresh(now) {
            TokenState::RefreshNeeded
        } else {
            TokenState::Valid
        };
        Self {
            state,
            expires_at: bundle.expires_at,
        }
    }
}
