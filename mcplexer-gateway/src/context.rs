//! Shared dependencies every session operates on

use std::sync::Arc;

use mcplexer_approval::ApprovalGate;
use mcplexer_auth::OAuthFlowManager;
use mcplexer_mcp::DownstreamManager;
use mcplexer_routing::RoutingEngine;
use mcplexer_storage::Store;

/// One per process; cloned into each session and listener
pub struct GatewayContext {
    pub store: Arc<dyn Store>,
    pub engine: Arc<RoutingEngine>,
    pub manager: Arc<DownstreamManager>,
    pub oauth: Arc<OAuthFlowManager>,
    pub gate: Arc<ApprovalGate>,
}
