//! Domain-specific configuration modules

pub mod database;
pub mod gateway;
pub mod logging;
pub mod provisioning;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::Validatable;

pub use database::DatabaseConfig;
pub use gateway::{GatewayConfig, GatewayMode};
pub use logging::LoggingConfig;
pub use provisioning::{RuleEntry, ScopeEntry, ServerEntry, WorkspaceEntry};

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McplexerConfig {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,

    /// Downstream servers provisioned from this file (`source=yaml`)
    pub servers: Vec<ServerEntry>,

    /// Workspaces provisioned from this file
    pub workspaces: Vec<WorkspaceEntry>,

    /// Auth scopes provisioned from this file
    pub scopes: Vec<ScopeEntry>,

    /// Route rules provisioned from this file
    pub rules: Vec<RuleEntry>,
}

impl McplexerConfig {
    /// Validate every domain and cross-references between provisioned rows
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.gateway.validate()?;
        self.database.validate()?;
        self.logging.validate()?;
        for server in &self.servers {
            server.validate()?;
        }
        for workspace in &self.workspaces {
            workspace.validate()?;
        }
        for scope in &self.scopes {
            scope.validate()?;
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        provisioning::validate_references(self)?;
        Ok(())
    }
}
