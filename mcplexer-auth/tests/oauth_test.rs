//! OAuth flow manager against a mock provider

use std::sync::Arc;

use chrono::{Duration, Utc};
use mcplexer_auth::{
    AuthError, CredentialInjector, Encryptor, OAuthFlowManager, PlaintextEncryptor, ProviderDiscovery, TokenBundle,
    TokenState,
};
use mcplexer_mcp::CredentialResolver;
use mcplexer_storage::entities::{AuthScope, OAuthProvider, ScopeKind};
use mcplexer_storage::{SqliteStore, Store};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    store: Arc<SqliteStore>,
    encryptor: Arc<PlaintextEncryptor>,
    oauth: Arc<OAuthFlowManager>,
    provider: OAuthProvider,
    scope: AuthScope,
}

async fn fixture(mock: &MockServer) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let encryptor = Arc::new(PlaintextEncryptor);

    let mut provider = OAuthProvider::new(
        "github",
        format!("{}/authorize", mock.uri()),
        format!("{}/token", mock.uri()),
        "client-123",
    );
    provider.scopes = vec!["repo".to_string(), "read:user".to_string()];
    store.create_oauth_provider(&provider).await.unwrap();

    let mut scope = AuthScope::new("github-oauth", ScopeKind::Oauth2);
    scope.oauth_provider_id = Some(provider.id.clone());
    store.create_auth_scope(&scope).await.unwrap();

    let oauth = Arc::new(OAuthFlowManager::new(
        store.clone() as Arc<dyn Store>,
        encryptor.clone() as Arc<dyn Encryptor>,
        "http://127.0.0.1:8321",
    ));

    Fixture {
        store,
        encryptor,
        oauth,
        provider,
        scope,
    }
}

async fn seed_token(fx: &Fixture, bundle: &TokenBundle) {
    let sealed = fx.encryptor.seal(&serde_json::to_vec(bundle).unwrap()).unwrap();
    fx.store
        .update_auth_scope_token_data(&fx.scope.id, Some(&sealed))
        .await
        .unwrap();
}

async fn stored_bundle(fx: &Fixture) -> TokenBundle {
    let scope = fx.store.get_auth_scope(&fx.scope.id).await.unwrap();
    serde_json::from_slice(&fx.encryptor.open(&scope.oauth_token_data.unwrap()).unwrap()).unwrap()
}

#[tokio::test]
async fn authorize_url_carries_pkce_and_state() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    let url = Url::parse(&fx.oauth.authorize_url(&fx.scope.id).await.unwrap()).unwrap();
    let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

    assert_eq!(params["response_type"], "code");
    assert_eq!(params["client_id"], "client-123");
    assert_eq!(params["redirect_uri"], "http://127.0.0.1:8321/api/v1/oauth/callback");
    assert_eq!(params["scope"], "repo read:user");
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["code_challenge"].len(), 43);
    assert!(!params["state"].is_empty());
    assert_eq!(fx.oauth.pending_authorizations(), 1);
}

#[tokio::test]
async fn callback_exchanges_code_and_persists_bundle() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code-1"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "repo read:user"
        })))
        .mount(&mock)
        .await;

    let url = Url::parse(&fx.oauth.authorize_url(&fx.scope.id).await.unwrap()).unwrap();
    let state = url
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    fx.oauth.handle_callback(&state, "auth-code-1").await.unwrap();

    let bundle = stored_bundle(&fx).await;
    assert_eq!(bundle.access_token, "at-1");
    assert_eq!(bundle.refresh_token.as_deref(), Some("rt-1"));
    assert!(bundle.expires_at.is_some());
    assert_eq!(bundle.scopes, vec!["repo", "read:user"]);

    // State tokens are single-use.
    let err = fx.oauth.handle_callback(&state, "auth-code-1").await.unwrap_err();
    assert!(matches!(err, AuthError::UnknownState));
}

#[tokio::test]
async fn get_valid_token_refreshes_near_expiry_and_preserves_refresh_token() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    // Stored token expires in one minute; inside the five-minute window.
    seed_token(
        &fx,
        &TokenBundle {
            access_token: "stale".into(),
            refresh_token: Some("rt-keep".into()),
            expires_at: Some(Utc::now() + Duration::minutes(1)),
            scopes: vec![],
        },
    )
    .await;

    // Refresh response omits the refresh token.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-keep"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let token = fx.oauth.get_valid_token(&fx.scope.id).await.unwrap();
    assert_eq!(token, "fresh");

    let bundle = stored_bundle(&fx).await;
    assert_eq!(bundle.refresh_token.as_deref(), Some("rt-keep"));

    // Plenty of lifetime now; no second refresh happens.
    let token = fx.oauth.get_valid_token(&fx.scope.id).await.unwrap();
    assert_eq!(token, "fresh");
}

#[tokio::test]
async fn non_expiring_token_is_returned_as_is() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    seed_token(
        &fx,
        &TokenBundle {
            access_token: "forever".into(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        },
    )
    .await;

    assert_eq!(fx.oauth.get_valid_token(&fx.scope.id).await.unwrap(), "forever");
}

#[tokio::test]
async fn refresh_failure_surfaces_without_looping() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    seed_token(
        &fx,
        &TokenBundle {
            access_token: "stale".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(Utc::now() + Duration::minutes(1)),
            scopes: vec![],
        },
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .expect(1)
        .mount(&mock)
        .await;

    let err = fx.oauth.get_valid_token(&fx.scope.id).await.unwrap_err();
    assert!(matches!(err, AuthError::RefreshFailed { .. }));
}

#[tokio::test]
async fn token_status_lifecycle() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    assert_eq!(fx.oauth.token_status(&fx.scope.id).await.unwrap().state, TokenState::None);

    seed_token(
        &fx,
        &TokenBundle {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::hours(2)),
            scopes: vec![],
        },
    )
    .await;
    assert_eq!(
        fx.oauth.token_status(&fx.scope.id).await.unwrap().state,
        TokenState::Valid
    );

    fx.oauth.revoke(&fx.scope.id).await.unwrap();
    assert_eq!(fx.oauth.token_status(&fx.scope.id).await.unwrap().state, TokenState::None);
}

#[tokio::test]
async fn injector_produces_bearer_headers_and_env() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    seed_token(
        &fx,
        &TokenBundle {
            access_token: "tok-abc".into(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        },
    )
    .await;

    let injector = CredentialInjector::new(
        fx.store.clone() as Arc<dyn Store>,
        fx.encryptor.clone() as Arc<dyn Encryptor>,
        fx.oauth.clone(),
    );

    let headers = injector.headers_for_scope(&fx.scope.id).await.unwrap();
    assert_eq!(headers["Authorization"], "Bearer tok-abc");

    let server = mcplexer_storage::entities::DownstreamServer::stdio("fs", "fs", "mcp-fs", vec![]);
    let env = injector.env_for_scope(&fx.scope.id, &server).await.unwrap();
    assert_eq!(env["ACCESS_TOKEN"], "tok-abc");

    // Empty scope id yields empty credentials.
    assert!(injector.headers_for_scope("").await.unwrap().is_empty());
}

#[tokio::test]
async fn static_header_scope_decrypts_verbatim() {
    let mock = MockServer::start().await;
    let fx = fixture(&mock).await;

    let mut scope = AuthScope::new("static-api-key", ScopeKind::Header);
    scope.encrypted_data = Some(
        fx.encryptor
            .seal(serde_json::to_vec(&json!({"X-Api-Key": "k-123"})).unwrap().as_slice())
            .unwrap(),
    );
    fx.store.create_auth_scope(&scope).await.unwrap();

    let injector = CredentialInjector::new(
        fx.store.clone() as Arc<dyn Store>,
        fx.encryptor.clone() as Arc<dyn Encryptor>,
        fx.oauth.clone(),
    );
    let headers = injector.headers_for_scope(&scope.id).await.unwrap();
    assert_eq!(headers["X-Api-Key"], "k-123");
}

#[tokio::test]
async fn discovery_registers_public_client() {
    let mock = MockServer::start().await;
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_servers": [mock.uri()]
        })))
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_endpoint": format!("{}/authorize", mock.uri()),
            "token_endpoint": format!("{}/token", mock.uri()),
            "registration_endpoint": format!("{}/register", mock.uri()),
            "code_challenge_methods_supported": ["S256", "plain"]
        })))
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .and(body_string_contains("MCPlexer"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "auto-client-9"
        })))
        .mount(&mock)
        .await;

    let discovery = ProviderDiscovery::new(store.clone() as Arc<dyn Store>, "http://127.0.0.1:8321");
    let provider = discovery
        .discover_and_register("remote-mcp", &format!("{}/mcp", mock.uri()))
        .await
        .unwrap();

    assert_eq!(provider.client_id, "auto-client-9");
    assert!(provider.use_pkce);

    let persisted = store.get_oauth_provider_by_name("remote-mcp").await.unwrap();
    assert_eq!(persisted.client_id, "auto-client-9");
    assert_eq!(
        persisted.source,
        mcplexer_storage::entities::RecordSource::AutoDiscovery
    );
}
