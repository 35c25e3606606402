//! Gateway listener configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_http_url, validate_non_empty, Validatable};

/// How clients reach the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// One client over the process's own stdio
    Stdio,
    /// Many clients over a Unix-domain socket
    Socket,
}

impl Default for GatewayMode {
    fn default() -> Self {
        Self::Stdio
    }
}

/// Gateway listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mode: GatewayMode,

    /// Socket path for `socket` mode
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Base URL OAuth providers redirect back to
    #[serde(default = "default_external_url")]
    pub external_url: String,

    /// Sessions idle longer than this (hours) are swept at startup
    #[serde(default = "default_stale_session_hours")]
    pub stale_session_hours: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Stdio,
            socket_path: default_socket_path(),
            external_url: default_external_url(),
            stale_session_hours: default_stale_session_hours(),
        }
    }
}

impl Validatable for GatewayConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.mode == GatewayMode::Socket {
            validate_non_empty(&self.socket_path, "socket_path", self.domain_name())?;
        }
        validate_http_url(&self.external_url, "external_url", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "gateway"
    }
}

fn default_socket_path() -> String {
    "/tmp/mcplexer.sock".to_string()
}

fn default_external_url() -> String {
    "http://127.0.0.1:8321".to_string()
}

fn default_stale_session_hours() -> u64 {
    24
}
