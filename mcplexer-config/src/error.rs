//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading the configuration file
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Semantic validation failure
    #[error("Invalid configuration in {domain}: {message}")]
    Domain { domain: &'static str, message: String },

    /// Environment variable override failure
    #[error("Environment variable {var}: {message}")]
    Env { var: String, message: String },

    /// URL field failed to parse
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ConfigError {
    pub fn domain(domain: &'static str, message: impl Into<String>) -> Self {
        Self::Domain {
            domain,
            message: message.into(),
        }
    }

    pub fn env(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Env {
            var: var.into(),
            message: message.into(),
        }
    }
}
