//! Database configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_non_empty, Validatable};

/// SQLite store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite path, or `:memory:` for an ephemeral store
    #[serde(default = "default_dsn")]
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { dsn: default_dsn() }
    }
}

impl Validatable for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_non_empty(&self.dsn, "dsn", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "database"
    }
}

fn default_dsn() -> String {
    "mcplexer.db".to_string()
}
