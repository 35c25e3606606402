//! Downstream side of the MCPlexer gateway
//!
//! Protocol types and framing, the stdio/HTTP instance implementations,
//! and the keyed instance pool that lazy-starts and idle-stops them.

pub mod error;
pub mod instance;
pub mod manager;
pub mod protocol;

pub use error::{McpError, McpResult};
pub use instance::{DownstreamInstance, HeaderOverlay, InstanceKey, InstanceState};
pub use manager::{CredentialResolver, DownstreamManager, InstanceInfo};
