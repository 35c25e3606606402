//! Domain-driven configuration for MCPlexer
//!
//! Modular configuration split by functional domain, with validation,
//! defaults, and `MCPLEXER_*` environment variable support.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

pub use domains::{
    DatabaseConfig, GatewayConfig, GatewayMode, LoggingConfig, McplexerConfig, RuleEntry, ScopeEntry, ServerEntry,
    WorkspaceEntry,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;
