//! Routing for MCPlexer: glob matching, rule compilation, deny-first
//! ordered matching, ancestor fallback, and the route result cache.

pub mod engine;
pub mod glob;

pub use engine::{CacheStats, RouteContext, RouteDecision, RouteError, RouteResult, RoutingEngine};
pub use glob::{glob_match, glob_specificity, tool_pattern_match, tool_specificity};
