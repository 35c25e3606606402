//! Wire protocol: JSON-RPC 2.0 framing plus typed MCP messages

pub mod jsonrpc;
pub mod messages;

pub use jsonrpc::{
    error_codes, read_frame, write_frame, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
    MAX_CLIENT_FRAME, MAX_STDIO_FRAME,
};
pub use messages::{
    methods, Implementation, InitializeParams, InitializeResult, Root, ServerCapabilities, ToolDef, ToolsCallParams,
    ToolsCapability, ToolsListResult, PROTOCOL_VERSION,
};
