//! The client-facing half of MCPlexer
//!
//! Gateway sessions (JSON-RPC framing, initialize, tools aggregation, the
//! tools/call pipeline), the stdio and Unix-socket listeners, the builtin
//! diagnostics tools, and the stdio↔socket bridge.

pub mod audit;
pub mod bridge;
pub mod builtin;
pub mod context;
pub mod error;
pub mod server;
pub mod session;
pub mod workspace;

pub use bridge::{bridge_streams, run_bridge};
pub use context::GatewayContext;
pub use error::{GatewayError, GatewayResult};
pub use server::{run_socket, run_stdio};
pub use session::run_session;
