//! Credentials for MCPlexer: encryption at rest, the OAuth2 flow manager,
//! and the injector that turns routing decisions into env or header maps.

pub mod crypto;
pub mod discovery;
pub mod error;
pub mod injector;
pub mod oauth;
pub mod templates;
pub mod token;

pub use crypto::{AesGcmEncryptor, Encryptor, PlaintextEncryptor};
pub use discovery::ProviderDiscovery;
pub use error::{AuthError, AuthResult};
pub use injector::{merge_env, CredentialInjector};
pub use oauth::OAuthFlowManager;
pub use templates::{find_template, provider_from_template, ProviderTemplate, TEMPLATES};
pub use token::{TokenBundle, TokenState, TokenStatus};
