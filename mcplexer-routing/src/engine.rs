//! Policy-resolving routing engine
//!
//! Rules are compiled per workspace (specificity precomputed, downstream
//! namespace attached), ordered deterministically, and walked first-match.
//! Results are cached by `(workspace, subpath, tool)`; any management-plane
//! mutation must call [`RoutingEngine::invalidate_all`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use mcplexer_storage::entities::{RoutePolicy, RouteRule};
use mcplexer_storage::{Store, StoreError};

use crate::glob::{any_tool_pattern_match, glob_match, glob_specificity, tool_specificity};

/// Routing failure modes surfaced to the gateway
#[derive(Error, Debug)]
pub enum RouteError {
    /// The most-preferred matching rule denies the call
    #[error("Denied by rule {rule_id}")]
    Denied { rule_id: String },

    /// No rule matched in any consulted workspace
    #[error("No route matched")]
    NoRoute,

    /// Store failure while compiling rules
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for routing operations
pub type RouteResult<T> = Result<T, RouteError>;

/// Lookup key into the routing engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteContext {
    pub workspace_id: String,
    /// Path of the client root relative to the workspace root
    pub subpath: String,
    pub tool_name: String,
}

/// A successful routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub matched_rule_id: String,
    /// The workspace whose rule matched (an ancestor under fallback)
    pub workspace_id: String,
    pub downstream_server_id: String,
    pub auth_scope_id: Option<String>,
    pub requires_approval: bool,
    pub approval_timeout_sec: Option<u64>,
    /// Whether this decision came from the result cache
    pub cache_hit: bool,
}

/// Cached outcome; deny and no-route are cached alongside allows so a
/// repeated blocked call never re-walks the rule list.
#[derive(Debug, Clone)]
enum CachedRoute {
    Allowed(RouteDecision),
    Denied { rule_id: String },
    NoRoute,
}

/// A rule with everything matching needs precomputed
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RouteRule,
    path_spec: u32,
    tool_spec: u32,
    /// Effective tool patterns (empty `tool_match` compiles to `["*"]`)
    tool_patterns: Vec<String>,
    /// Namespace of the referenced downstream, when it has one
    namespace: Option<String>,
}

/// Hit/miss counters for the result cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// The routing engine. Cheap to share; all interior state is locked.
pub struct RoutingEngine {
    store: Arc<dyn Store>,
    compiled: RwLock<HashMap<String, Arc<Vec<CompiledRule>>>>,
    results: RwLock<HashMap<RouteContext, CachedRoute>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RoutingEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            compiled: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve one `(workspace, subpath, tool)` lookup
    pub async fn route(&self, ctx: &RouteContext) -> RouteResult<RouteDecision> {
        if let Some(cached) = self.results.read().await.get(ctx) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return match cached {
                CachedRoute::Allowed(decision) => {
                    let mut decision = decision.clone();
                    decision.cache_hit = true;
                    Ok(decision)
                }
                CachedRoute::Denied { rule_id } => Err(RouteError::Denied {
                    rule_id: rule_id.clone(),
                }),
                CachedRoute::NoRoute => Err(RouteError::NoRoute),
            };
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let outcome = self.route_uncached(ctx).await?;
        self.results.write().await.insert(ctx.clone(), outcome.clone());

        match outcome {
            CachedRoute::Allowed(decision) => Ok(decision),
            CachedRoute::Denied { rule_id } => Err(RouteError::Denied { rule_id }),
            CachedRoute::NoRoute => Err(RouteError::NoRoute),
        }
    }

    /// Walk workspace ancestors, nearest first. A deny stops the walk; a
    /// match returns; no-route falls through to the next ancestor.
    pub async fn route_with_fallback(&self, ancestors: &[RouteContext]) -> RouteResult<RouteDecision> {
        for ctx in ancestors {
            match self.route(ctx).await {
                Ok(decision) => return Ok(decision),
                Err(RouteError::NoRoute) => continue,
                Err(denied @ RouteError::Denied { .. }) => return Err(denied),
                Err(other) => return Err(other),
            }
        }
        Err(RouteError::NoRoute)
    }

    /// Drop every compiled rule list and cached result
    pub async fn invalidate_all(&self) {
        self.compiled.write().await.clear();
        self.results.write().await.clear();
        debug!("route caches invalidated");
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    async fn route_uncached(&self, ctx: &RouteContext) -> RouteResult<CachedRoute> {
        let rules = self.compiled_rules(&ctx.workspace_id).await?;

        for compiled in rules.iter() {
            if !glob_match(&compiled.rule.path_glob, &ctx.subpath) {
                continue;
            }
            if !any_tool_pattern_match(&compiled.tool_patterns, &ctx.tool_name) {
                continue;
            }
            // A rule bound to a namespaced server never captures a tool that
            // names a different namespace.
            if let (Some(namespace), Some((prefix, _))) = (&compiled.namespace, ctx.tool_name.split_once("__")) {
                if prefix != namespace {
                    continue;
                }
            }

            trace!(rule = %compiled.rule.id, tool = %ctx.tool_name, "rule matched");
            return Ok(match compiled.rule.policy {
                RoutePolicy::Deny => CachedRoute::Denied {
                    rule_id: compiled.rule.id.clone(),
                },
                RoutePolicy::Allow => CachedRoute::Allowed(RouteDecision {
                    matched_rule_id: compiled.rule.id.clone(),
                    workspace_id: ctx.workspace_id.clone(),
                    // validated non-empty for allow rules at the store
                    downstream_server_id: compiled.rule.downstream_server_id.clone().unwrap_or_default(),
                    auth_scope_id: compiled.rule.auth_scope_id.clone(),
                    requires_approval: compiled.rule.requires_approval,
                    approval_timeout_sec: compiled.rule.approval_timeout_sec,
                    cache_hit: false,
                }),
            });
        }

        Ok(CachedRoute::NoRoute)
    }

    async fn compiled_rules(&self, workspace_id: &str) -> RouteResult<Arc<Vec<CompiledRule>>> {
        if let Some(rules) = self.compiled.read().await.get(workspace_id) {
            return Ok(rules.clone());
        }

        let raw = self.store.list_route_rules_for_workspace(workspace_id).await?;
        let servers: HashMap<String, _> = self
            .store
            .list_downstream_servers()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut compiled: Vec<CompiledRule> = raw
            .into_iter()
            .filter_map(|rule| {
                let namespace = match rule.downstream_server_id.as_deref() {
                    Some(server_id) => match servers.get(server_id) {
                        Some(server) if server.disabled => {
                            debug!(rule = %rule.id, server = %server.name, "skipping rule for disabled server");
                            return None;
                        }
                        Some(server) => Some(server.tool_namespace.clone()),
                        None => {
                            debug!(rule = %rule.id, server_id, "skipping rule for unknown server");
                            return None;
                        }
                    },
                    None => None,
                };
                let tool_patterns = if rule.tool_match.is_empty() {
                    vec!["*".to_string()]
                } else {
                    rule.tool_match.clone()
                };
                Some(CompiledRule {
                    path_spec: glob_specificity(&rule.path_glob),
                    tool_spec: tool_specificity(&tool_patterns),
                    tool_patterns,
                    namespace,
                    rule,
                })
            })
            .collect();

        // Path specificity dominates priority so a high-priority catch-all
        // never beats a concretely targeted path.
        compiled.sort_by(|a, b| {
            b.path_spec
                .cmp(&a.path_spec)
                .then(b.tool_spec.cmp(&a.tool_spec))
                .then(b.rule.priority.cmp(&a.rule.priority))
                .then(a.rule.id.cmp(&b.rule.id))
        });

        let compiled = Arc::new(compiled);
        self.compiled
            .write()
            .await
            .insert(workspace_id.to_string(), compiled.clone());
        Ok(compiled)
    }
}
