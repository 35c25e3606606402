//! Built-in OAuth provider templates
//!
//! Well-known providers ship with their endpoints and PKCE settings so an
//! operator only supplies a client id (and secret, where the provider
//! requires one). A provider created from a template records the
//! `template_id` it came from.

use mcplexer_storage::entities::OAuthProvider;

/// One well-known provider definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTemplate {
    pub id: &'static str,
    pub display_name: &'static str,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub default_scopes: &'static [&'static str],
    pub use_pkce: bool,
}

/// Templates for providers commonly fronting MCP servers
pub const TEMPLATES: &[ProviderTemplate] = &[
    ProviderTemplate {
        id: "github",
        display_name: "GitHub",
        authorize_url: "https://github.com/login/oauth/authorize",
        token_url: "https://github.com/login/oauth/access_token",
        default_scopes: &["repo", "read:user"],
        use_pkce: false,
    },
    ProviderTemplate {
        id: "google",
        display_name: "Google",
        authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        default_scopes: &["openid", "email"],
        use_pkce: true,
    },
    ProviderTemplate {
        id: "slack",
        display_name: "Slack",
        authorize_url: "https://slack.com/oauth/v2/authorize",
        token_url: "https://slack.com/api/oauth.v2.access",
        default_scopes: &[],
        use_pkce: false,
    },
    ProviderTemplate {
        id: "linear",
        display_name: "Linear",
        authorize_url: "https://linear.app/oauth/authorize",
        token_url: "https://api.linear.app/oauth/token",
        default_scopes: &["read"],
        use_pkce: true,
    },
];

/// Look up a template by id
pub fn find_template(id: &str) -> Option<&'static ProviderTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// Instantiate a provider record from a template. The caller persists it
/// (and seals the client secret) separately.
pub fn provider_from_template(template: &ProviderTemplate, name: &str, client_id: &str) -> OAuthProvider {
    let mut provider = OAuthProvider::new(name, template.authorize_url, template.token_url, client_id);
    provider.template_id = Some(template.id.to_string());
    provider.scopes = template.default_scopes.iter().map(|s| s.to_string()).collect();
    provider.use_pkce = template.use_pkce;
    provider
}
