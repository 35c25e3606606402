//! Credential injector: auth scope → env map or header map
//!
//! The bridge between routing decisions and downstream authentication. For
//! stdio children the result is an environment; for HTTP calls a header
//! overlay. Failures propagate so the gateway can surface a structured
//! reauth error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mcplexer_mcp::{CredentialResolver, HeaderOverlay, McpError, McpResult};
use mcplexer_storage::entities::{AuthScope, DownstreamServer, ScopeKind};
use mcplexer_storage::Store;

use crate::crypto::Encryptor;
use crate::error::{AuthError, AuthResult};
use crate::oauth::OAuthFlowManager;

/// Env var the access token is injected under for stdio children
pub const ACCESS_TOKEN_VAR: &str = "ACCESS_TOKEN";

/// Resolves auth scopes into concrete credentials
pub struct CredentialInjector {
    store: Arc<dyn Store>,
    encryptor: Arc<dyn Encryptor>,
    oauth: Arc<OAuthFlowManager>,
}

impl CredentialInjector {
    pub fn new(store: Arc<dyn Store>, encryptor: Arc<dyn Encryptor>, oauth: Arc<OAuthFlowManager>) -> Self {
        Self {
            store,
            encryptor,
            oauth,
        }
    }

    /// Credentials a scope contributes, as a plain key/value map
    async fn resolve_scope(&self, scope_id: &str) -> AuthResult<HashMap<String, String>> {
        if scope_id.is_empty() {
            return Ok(HashMap::new());
        }
        let scope = self.store.get_auth_scope(scope_id).await?;
        match scope.scope_type {
            ScopeKind::Oauth2 => {
                let token = self.oauth.get_valid_token(scope_id).await?;
                Ok(HashMap::from([(ACCESS_TOKEN_VAR.to_string(), token)]))
            }
            ScopeKind::Env | ScopeKind::Header => self.static_values(&scope),
        }
    }

    fn static_values(&self, scope: &AuthScope) -> AuthResult<HashMap<String, String>> {
        let Some(sealed) = scope.encrypted_data.as_deref() else {
            return Ok(HashMap::new());
        };
        let plaintext = self.encryptor.open(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[async_trait]
impl CredentialResolver for CredentialInjector {
    async fn env_for_scope(&self, scope_id: &str, server: &DownstreamServer) -> McpResult<HashMap<String, String>> {
        let auth_env = self.resolve_scope(scope_id).await.map_err(into_mcp_error)?;
        let os_env: HashMap<String, String> = std::env::vars().collect();
        debug!(server = %server.name, scope_id, vars = auth_env.len(), "env resolved for stdio child");
        Ok(merge_env(&os_env, &server.env, &auth_env))
    }

    async fn headers_for_scope(&self, scope_id: &str) -> McpResult<HeaderOverlay> {
        if scope_id.is_empty() {
            return Ok(HeaderOverlay::new());
        }
        let scope = self.store.get_auth_scope(scope_id).await.map_err(McpError::from)?;
        match scope.scope_type {
            ScopeKind::Oauth2 => {
                let token = self.oauth.get_valid_token(scope_id).await.map_err(into_mcp_error)?;
                Ok(HeaderOverlay::from([(
                    "Authorization".to_string(),
                    format!("Bearer {token}"),
                )]))
            }
            ScopeKind::Env | ScopeKind::Header => self.static_values(&scope).map_err(into_mcp_error),
        }
    }
}

/// Token problems become `AuthRequired` so the gateway can tell the client
/// which scope needs reauthorization; everything else is a credential error.
fn into_mcp_error(err: AuthError) -> McpError {
    match err {
        AuthError::NoToken { .. } | AuthError::RefreshFailed { .. } => McpError::AuthRequired {
            message: err.to_string(),
        },
        other => McpError::Credential {
            message: other.to_string(),
        },
    }
}

/// Merge environments with `auth > server > os` precedence. Server-declared
/// values may reference already-merged variables with `${VAR}`.
pub fn merge_env(
    os_env: &HashMap<String, String>,
    server_env: &HashMap<String, String>,
    auth_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = os_env.clone();
    for (key, value) in server_env {
        let expanded = expand_vars(value, &merged);
        merged.insert(key.clone(), expanded);
    }
    for (key, value) in auth_env {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Expand `${VAR}` references against `env`; unknown variables expand to
/// the empty string.
fn expand_vars(value: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(replacement) = env.get(name) {
                    out.push_str(replacement);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
