//! Configuration loading and environment variable overrides

use std::path::Path;

use tracing::debug;

use crate::domains::{GatewayMode, McplexerConfig};
use crate::error::{ConfigError, ConfigResult};

/// Loads YAML configuration and applies `MCPLEXER_*` overrides
pub struct ConfigLoader {
    prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            prefix: "MCPLEXER".to_string(),
        }
    }

    /// Override the env prefix (used by tests to isolate the environment)
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load from a YAML file, apply env overrides, and validate
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<McplexerConfig> {
        let content = std::fs::read_to_string(&path)?;
        let mut config: McplexerConfig = serde_yaml::from_str(&content)?;
        debug!(path = %path.as_ref().display(), "loaded config file");
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Defaults plus env overrides only
    pub fn from_env(&self) -> ConfigResult<McplexerConfig> {
        let mut config = McplexerConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// File when given, env-only otherwise
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<McplexerConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut McplexerConfig) -> ConfigResult<()> {
        if let Some(mode) = self.var("MODE") {
            config.gateway.mode = match mode.as_str() {
                "stdio" => GatewayMode::Stdio,
                "socket" => GatewayMode::Socket,
                other => {
                    return Err(ConfigError::env(
                        format!("{}_MODE", self.prefix),
                        format!("expected stdio or socket, got {other:?}"),
                    ))
                }
            };
        }
        if let Some(path) = self.var("SOCKET_PATH") {
            config.gateway.socket_path = path;
        }
        if let Some(url) = self.var("EXTERNAL_URL") {
            config.gateway.external_url = url;
        }
        if let Some(dsn) = self.var("DB_DSN") {
            config.database.dsn = dsn;
        }
        if let Some(level) = self.var("LOG_LEVEL") {
            config.logging.level = level;
        }
        Ok(())
    }

    fn var(&self, suffix: &str) -> Option<String> {
        std::env::var(format!("{}_{suffix}", self.prefix)).ok().filter(|v| !v.is_empty())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_full_document() {
        let yaml = r#"
gateway:
  mode: socket
  socket_path: /run/mcplexer.sock
database:
  dsn: /var/lib/mcplexer/state.db
logging:
  level: debug
servers:
  - name: filesystem
    namespace: fs
    transport: stdio
    command: mcp-server-fs
    args: ["--root", "/"]
  - name: github
    namespace: github
    transport: http
    url: https://mcp.github.example/api
workspaces:
  - name: global
    root: /
    default_policy: deny
scopes:
  - name: gh-token
    type: header
    values:
      Authorization: "Bearer xyz"
rules:
  - workspace: global
    path: "**"
    tools: ["fs__*"]
    server: filesystem
    priority: 10
  - workspace: global
    path: "**"
    tools: ["github__*"]
    server: github
    scope: gh-token
    requires_approval: true
    approval_timeout_sec: 30
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = ConfigLoader::with_prefix("MCPLEXER_TEST_NONE")
            .from_file(file.path())
            .unwrap();
        assert_eq!(config.gateway.mode, GatewayMode::Socket);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[1].approval_timeout_sec, Some(30));
    }

    #[test]
    fn rejects_unknown_rule_references() {
        let yaml = r#"
workspaces:
  - name: global
    root: /
rules:
  - workspace: global
    path: "**"
    server: missing-server
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let err = ConfigLoader::with_prefix("MCPLEXER_TEST_NONE")
            .from_file(file.path())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Domain { domain: "rules", .. }));
    }

    #[test]
    fn env_overrides_take_effect() {
        std::env::set_var("MCPX_UT_DB_DSN", "/tmp/override.db");
        std::env::set_var("MCPX_UT_LOG_LEVEL", "warn");
        let config = ConfigLoader::with_prefix("MCPX_UT").from_env().unwrap();
        assert_eq!(config.database.dsn, "/tmp/override.db");
        assert_eq!(config.logging.level, "warn");
        std::env::remove_var("MCPX_UT_DB_DSN");
        std::env::remove_var("MCPX_UT_LOG_LEVEL");
    }

    #[test]
    fn duplicate_namespace_rejected() {
        let yaml = r#"
servers:
  - name: a
    namespace: fs
    transport: stdio
    command: a-bin
  - name: b
    namespace: fs
    transport: stdio
    command: b-bin
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        assert!(ConfigLoader::with_prefix("MCPX_UT2").from_file(file.path()).is_err());
    }
}
