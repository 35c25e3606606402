//! OAuth server discovery and Dynamic Client Registration
//!
//! For downstreams without a built-in provider template: fetch the
//! protected-resource metadata to find the authorization server, read its
//! metadata document, and (when a registration endpoint is advertised)
//! register a public client via RFC 7591.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use mcplexer_storage::entities::{OAuthProvider, RecordSource};
use mcplexer_storage::Store;

use crate::error::{AuthError, AuthResult};
use crate::oauth::CALLBACK_PATH;

/// `/.well-known/oauth-protected-resource` body
#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// `/.well-known/oauth-authorization-server` body (RFC 8414 subset)
#[derive(Debug, Deserialize)]
struct AuthorizationServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    code_challenge_methods_supported: Vec<String>,
}

/// RFC 7591 registration response subset
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

/// Discovers endpoints for a resource origin and persists a provider record
pub struct ProviderDiscovery {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    external_url: String,
}

impl ProviderDiscovery {
    pub fn new(store: Arc<dyn Store>, external_url: impl Into<String>) -> Self {
        Self {
            store,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            external_url: external_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Walk the discovery documents for `resource_url`'s origin and create a
    /// provider named `provider_name`. PKCE is enabled iff the server
    /// advertises S256.
    pub async fn discover_and_register(&self, provider_name: &str, resource_url: &str) -> AuthResult<OAuthProvider> {
        let origin = origin_of(resource_url)?;

        let resource_meta: ProtectedResourceMetadata = self
            .fetch_json(&format!("{origin}/.well-known/oauth-protected-resource"))
            .await?;
        let auth_server = resource_meta
            .authorization_servers
            .first()
            .ok_or_else(|| AuthError::discovery(format!("{origin} lists no authorization servers")))?
            .trim_end_matches('/')
            .to_string();

        let server_meta: AuthorizationServerMetadata = self
            .fetch_json(&format!("{auth_server}/.well-known/oauth-authorization-server"))
            .await?;
        let use_pkce = server_meta
            .code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256");

        let client_id = match &server_meta.registration_endpoint {
            Some(endpoint) => self.register_client(endpoint).await?,
            None => {
                return Err(AuthError::discovery(format!(
                    "{auth_server} has no registration endpoint; configure a client id manually"
                )))
            }
        };

        let mut provider = OAuthProvider::new(
            provider_name,
            server_meta.authorization_endpoint,
            server_meta.token_endpoint,
            client_id,
        );
        provider.use_pkce = use_pkce;
        provider.source = RecordSource::AutoDiscovery;
        self.store.create_oauth_provider(&provider).await?;

        info!(provider = %provider.name, auth_server, pkce = use_pkce, "provider auto-discovered");
        Ok(provider)
    }

    async fn register_client(&self, endpoint: &str) -> AuthResult<String> {
        let body = json!({
            "client_name": "MCPlexer",
            "redirect_uris": [format!("{}{}", self.external_url, CALLBACK_PATH)],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });

        let response = self.http.post(endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::discovery(format!(
                "registration at {endpoint} returned {status}: {body}"
            )));
        }
        let registered: RegistrationResponse = response.json().await?;
        debug!(endpoint, client_id = %registered.client_id, "dynamic client registered");
        Ok(registered.client_id)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> AuthResult<T> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::discovery(format!("{url} returned {status}")));
        }
        Ok(response.json().await?)
    }
}

fn origin_of(resource_url: &str) -> AuthResult<String> {
    let url = Url::parse(resource_url).map_err(|e| AuthError::invalid_url(format!("{resource_url}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AuthError::invalid_url(format!(
            "discovery requires an http(s) URL, got {resource_url}"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| AuthError::invalid_url(format!("{resource_url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}
