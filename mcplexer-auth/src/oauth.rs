//! OAuth2 authorization-code flow with optional PKCE S256
//!
//! Pending authorizations live in an in-memory state table with a 10-minute
//! TTL; they survive neither crash nor restart by design. Token upkeep is
//! on the critical path: `get_valid_token` refreshes when less than five
//! minutes of lifetime remain and surfaces a single refresh failure rather
//! than looping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration as StdDuration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use mcplexer_storage::entities::{AuthScope, OAuthProvider, ScopeKind};
use mcplexer_storage::Store;

use crate::crypto::Encryptor;
use crate::error::{AuthError, AuthResult};
use crate::token::{TokenBundle, TokenStatus};

/// TTL for pending authorization state tokens
pub const STATE_TTL: StdDuration = StdDuration::from_secs(600);

/// Path the external URL routes to this manager's callback
pub const CALLBACK_PATH: &str = "/api/v1/oauth/callback";

struct PendingAuth {
    auth_scope_id: String,
    code_verifier: Option<String>,
    created_at: Instant,
}

/// Wire shape of token endpoint responses (RFC 6749 §5.1)
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: Option<String>,
}

/// Manages the authorization-code flow and token freshness for oauth2
/// scopes.
pub struct OAuthFlowManager {
    store: Arc<dyn Store>,
    encryptor: Arc<dyn Encryptor>,
    http: reqwest::Client,
    /// Base URL the provider redirects back to
    external_url: String,
    states: StdMutex<HashMap<String, PendingAuth>>,
}

impl OAuthFlowManager {
    pub fn new(store: Arc<dyn Store>, encryptor: Arc<dyn Encryptor>, external_url: impl Into<String>) -> Self {
        Self {
            store,
            encryptor,
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(30))
                .build()
                .unwrap_or_default(),
            external_url: external_url.into().trim_end_matches('/').to_string(),
            states: StdMutex::new(HashMap::new()),
        }
    }

    fn redirect_uri(&self) -> String {
        format!("{}{}", self.external_url, CALLBACK_PATH)
    }

    /// Build the provider authorize URL for a scope and remember the state
    /// token. The state value is opaque and single-use.
    pub async fn authorize_url(&self, scope_id: &str) -> AuthResult<String> {
        let (scope, provider) = self.scope_and_provider(scope_id).await?;

        let mut url = Url::parse(&provider.authorize_url)
            .map_err(|e| AuthError::invalid_url(format!("{}: {e}", provider.authorize_url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
            return Err(AuthError::invalid_url(format!(
                "authorize URL must be http(s) with a host: {}",
                provider.authorize_url
            )));
        }

        let state = random_token(16);
        let code_verifier = if provider.use_pkce {
            // 32 random bytes base64url-encode to exactly 43 characters
            Some(random_token(32))
        } else {
            None
        };

        {
            let mut states = self.states.lock().expect("state table poisoned");
            // Opportunistic sweep keeps the table from accumulating
            // abandoned authorizations.
            states.retain(|_, pending| pending.created_at.elapsed() < STATE_TTL);
            states.insert(
                state.clone(),
                PendingAuth {
                    auth_scope_id: scope.id.clone(),
                    code_verifier: code_verifier.clone(),
                    created_at: Instant::now(),
                },
            );
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &provider.client_id);
            query.append_pair("redirect_uri", &self.redirect_uri());
            query.append_pair("state", &state);
            if !provider.scopes.is_empty() {
                query.append_pair("scope", &provider.scopes.join(" "));
            }
            if let Some(verifier) = &code_verifier {
                let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
                query.append_pair("code_challenge", &challenge);
                query.append_pair("code_challenge_method", "S256");
            }
        }

        debug!(scope = %scope.name, provider = %provider.name, "authorization started");
        Ok(url.into())
    }

    /// Exchange the callback `(state, code)` for a token bundle and persist
    /// it on the scope.
    pub async fn handle_callback(&self, state: &str, code: &str) -> AuthResult<()> {
        let pending = {
            let mut states = self.states.lock().expect("state table poisoned");
            states.remove(state).ok_or(AuthError::UnknownState)?
        };
        if pending.created_at.elapsed() >= STATE_TTL {
            return Err(AuthError::StateExpired);
        }

        let (scope, provider) = self.scope_and_provider(&pending.auth_scope_id).await?;
        let client_secret = self.client_secret(&provider)?;

        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri()),
            ("client_id", provider.client_id.clone()),
        ];
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(verifier) = &pending.code_verifier {
            form.push(("code_verifier", verifier.clone()));
        }

        let response = self.token_request(&provider.token_url, &form).await?;
        let bundle = bundle_from_response(response, None);
        self.persist_bundle(&scope.id, &bundle).await?;

        info!(scope = %scope.name, provider = %provider.name, "authorization complete");
        Ok(())
    }

    /// Return an access token with at least five minutes of life left (or a
    /// non-expiring one), refreshing if needed. A refresh failure surfaces;
    /// a second call does not loop.
    pub async fn get_valid_token(&self, scope_id: &str) -> AuthResult<String> {
        let (scope, provider) = self.scope_and_provider(scope_id).await?;
        let bundle = self.stored_bundle(&scope)?;

        let now = Utc::now();
        if !bundle.needs_refresh(now) {
            return Ok(bundle.access_token);
        }

        let refreshed = self.refresh_bundle(&scope, &provider, bundle).await?;
        Ok(refreshed.access_token)
    }

    /// Force a refresh regardless of remaining lifetime
    pub async fn refresh_token(&self, scope_id: &str) -> AuthResult<()> {
        let (scope, provider) = self.scope_and_provider(scope_id).await?;
        let bundle = self.stored_bundle(&scope)?;
        self.refresh_bundle(&scope, &provider, bundle).await?;
        Ok(())
    }

    /// Lifecycle summary for the admin surface
    pub async fn token_status(&self, scope_id: &str) -> AuthResult<TokenStatus> {
        let scope = self.store.get_auth_scope(scope_id).await?;
        let Some(sealed) = scope.oauth_token_data.as_deref() else {
            return Ok(TokenStatus::none());
        };
        let bundle: TokenBundle = serde_json::from_slice(&self.encryptor.open(sealed)?)?;
        Ok(TokenStatus::of(&bundle, Utc::now()))
    }

    /// Clear stored token bytes
    pub async fn revoke(&self, scope_id: &str) -> AuthResult<()> {
        self.store.update_auth_scope_token_data(scope_id, None).await?;
        info!(scope_id, "token revoked");
        Ok(())
    }

    async fn refresh_bundle(
        &self,
        scope: &AuthScope,
        provider: &OAuthProvider,
        bundle: TokenBundle,
    ) -> AuthResult<TokenBundle> {
        let refresh_token = bundle.refresh_token.clone().ok_or_else(|| AuthError::RefreshFailed {
            scope_id: scope.id.clone(),
            message: "no refresh token stored".to_string(),
        })?;
        let client_secret = self.client_secret(provider)?;

        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", provider.client_id.clone()),
        ];
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .token_request(&provider.token_url, &form)
            .await
            .map_err(|e| match e {
                AuthError::TokenEndpoint { status, body } => AuthError::RefreshFailed {
                    scope_id: scope.id.clone(),
                    message: format!("token endpoint returned {status}: {body}"),
                },
                other => other,
            })?;

        // Providers may omit the refresh token on refresh; keep the old one.
        let refreshed = bundle_from_response(response, Some(refresh_token));
        self.persist_bundle(&scope.id, &refreshed).await?;
        debug!(scope = %scope.name, "token refreshed");
        Ok(refreshed)
    }

    async fn token_request(&self, token_url: &str, form: &[(&str, String)]) -> AuthResult<TokenEndpointResponse> {
        let response = self.http.post(token_url).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(token_url, status = status.as_u16(), "token endpoint error");
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn scope_and_provider(&self, scope_id: &str) -> AuthResult<(AuthScope, OAuthProvider)> {
        let scope = self.store.get_auth_scope(scope_id).await?;
        if scope.scope_type != ScopeKind::Oauth2 {
            return Err(AuthError::scope_misconfigured(format!(
                "scope '{}' is {}, not oauth2",
                scope.name,
                scope.scope_type.as_str()
            )));
        }
        let provider_id = scope
            .oauth_provider_id
            .clone()
            .ok_or_else(|| AuthError::scope_misconfigured(format!("scope '{}' has no provider", scope.name)))?;
        let provider = self.store.get_oauth_provider(&provider_id).await?;
        Ok((scope, provider))
    }

    fn stored_bundle(&self, scope: &AuthScope) -> AuthResult<TokenBundle> {
        let sealed = scope.oauth_token_data.as_deref().ok_or_else(|| AuthError::NoToken {
            scope_id: scope.id.clone(),
        })?;
        Ok(serde_json::from_slice(&self.encryptor.open(sealed)?)?)
    }

    async fn persist_bundle(&self, scope_id: &str, bundle: &TokenBundle) -> AuthResult<()> {
        let sealed = self.encryptor.seal(&serde_json::to_vec(bundle)?)?;
        self.store.update_auth_scope_token_data(scope_id, Some(&sealed)).await?;
        Ok(())
    }

    fn client_secret(&self, provider: &OAuthProvider) -> AuthResult<Option<String>> {
        if provider.client_secret_enc.is_empty() {
            return Ok(None);
        }
        let plaintext = self.encryptor.open(&provider.client_secret_enc)?;
        let secret =
            String::from_utf8(plaintext).map_err(|e| AuthError::crypto(format!("client secret not utf-8: {e}")))?;
        Ok(Some(secret))
    }

    /// Number of live entries in the state table (for diagnostics)
    pub fn pending_authorizations(&self) -> usize {
        self.states.lock().expect("state table poisoned").len()
    }
}

/// `n` random bytes, base64url-encoded without padding
fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn bundle_from_response(response: TokenEndpointResponse, previous_refresh: Option<String>) -> TokenBundle {
    let expires_at = match response.expires_in {
        Some(seconds) if seconds > 0 => Some(Utc::now() + Duration::seconds(seconds)),
        _ => None,
    };
    TokenBundle {
        access_token: response.access_token,
        refresh_token: response.refresh_token.or(previous_refresh),
        expires_at,
        scopes: response
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_have_pkce_length() {
        // 32 bytes -> 43 base64url chars, the RFC 7636 verifier length
        assert_eq!(random_token(32).len(), 43);
        assert_eq!(random_token(16).len(), 22);
        assert_ne!(random_token(32), random_token(32));
    }

    #[test]
    fn bundle_preserves_previous_refresh_token() {
        let response = TokenEndpointResponse {
            access_token: "new-access".into(),
            refresh_token: None,
            expires_in: Some(3600),
            scope: None,
            token_type: Some("Bearer".into()),
        };
        let bundle = bundle_from_response(response, Some("old-refresh".into()));
        assert_eq!(bundle.refresh_token.as_deref(), Some("old-refresh"));
        assert!(bundle.expires_at.is_some());
    }

    #[test]
    fn zero_expires_in_means_non_expiring() {
        let response = TokenEndpointResponse {
            access_token: "tok".into(),
            refresh_token: None,
            expires_in: Some(0),
            scope: Some("repo read".into()),
            token_type: None,
        };
        let bundle = bundle_from_response(response, None);
        assert!(bundle.expires_at.is_none());
        assert_eq!(bundle.scopes, vec!["repo", "read"]);
    }
}
