//! Downstream instances
//!
//! An instance is one live connection to a downstream server: a child
//! process for stdio, a remote session for HTTP. Instances are owned by the
//! [`crate::manager::DownstreamManager`] and keyed by `(server, auth scope)`.

pub mod http;
pub mod stdio;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpResult;

/// Pool key: one instance per `(server, auth scope)` pair. A scope-less
/// instance (used for discovery) has an empty `auth_scope_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub server_id: String,
    pub auth_scope_id: String,
}

impl InstanceKey {
    pub fn new(server_id: impl Into<String>, auth_scope_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            auth_scope_id: auth_scope_id.into(),
        }
    }

    /// Key for the scope-less discovery instance of a server
    pub fn anonymous(server_id: impl Into<String>) -> Self {
        Self::new(server_id, "")
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.auth_scope_id.is_empty() {
            write!(f, "{}", self.server_id)
        } else {
            write!(f, "{}@{}", self.server_id, self.auth_scope_id)
        }
    }
}

/// Instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceState {
    Stopped = 0,
    Starting = 1,
    Ready = 2,
    Busy = 3,
    Idle = 4,
    Stopping = 5,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Busy,
            4 => Self::Idle,
            5 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Lock-free state cell shared between an instance and its background tasks
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: InstanceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> InstanceState {
        InstanceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: InstanceState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Set `state` only when the current state is `expected`
    pub fn transition(&self, expected: InstanceState, state: InstanceState) -> bool {
        self.0
            .compare_exchange(expected as u8, state as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Extra per-request headers (HTTP instances only; stdio ignores them)
pub type HeaderOverlay = HashMap<String, String>;

/// Common capability set over stdio, HTTP, and internal instances.
/// Dispatch is via this trait; no downcasting in the pool.
#[async_trait]
pub trait DownstreamInstance: Send + Sync {
    /// Connect and run the MCP handshake. Idempotent while running.
    async fn start(&self) -> McpResult<()>;

    /// Tear the connection down; queued requests fail with a transport error
    async fn stop(&self) -> McpResult<()>;

    /// Send one JSON-RPC request and await its response value
    async fn request(&self, method: &str, params: Option<Value>, headers: Option<&HeaderOverlay>) -> McpResult<Value>;

    fn state(&self) -> InstanceState;

    fn key(&self) -> &InstanceKey;
}
