//! Workspace ancestor resolution from client roots
//!
//! A session's first root anchors it in the workspace tree: every workspace
//! whose `root_path` contains the root is an ancestor, nearest first, and
//! the global workspace (root `/`) closes the chain. Each ancestor carries
//! the client root's path relative to that workspace root, which is what
//! route rules' path globs match against.

use std::sync::Arc;

use tracing::debug;

use mcplexer_storage::entities::Workspace;
use mcplexer_storage::Store;

use crate::error::GatewayResult;

/// One ancestor in the fallback chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ancestor {
    pub workspace_id: String,
    pub workspace_name: String,
    /// Client root relative to the workspace root ("" when equal)
    pub subpath: String,
}

/// Turn a `file://` root URI into a filesystem path
pub fn root_uri_to_path(uri: &str) -> Option<String> {
    let path = uri.strip_prefix("file://")?;
    if path.is_empty() {
        return Some("/".to_string());
    }
    Some(path.to_string())
}

/// Compute the ancestor chain for a client root path, nearest first.
///
/// Workspaces whose root is not a path prefix of `client_root` are ignored.
/// With no client root at all, only the global workspace (root `/`)
/// remains, with an empty subpath.
pub async fn resolve_ancestors(store: &Arc<dyn Store>, client_root: Option<&str>) -> GatewayResult<Vec<Ancestor>> {
    let workspaces = store.list_workspaces().await?;
    let mut ancestors: Vec<(usize, Ancestor)> = Vec::new();

    for workspace in &workspaces {
        let subpath = match client_root {
            Some(root) => match relative_path(root, &workspace.root_path) {
                Some(subpath) => subpath,
                None => continue,
            },
            // No root: only the global workspace applies
            None if is_global(workspace) => String::new(),
            None => continue,
        };
        ancestors.push((
            workspace.root_path.trim_end_matches('/').len(),
            Ancestor {
                workspace_id: workspace.id.clone(),
                workspace_name: workspace.name.clone(),
                subpath,
            },
        ));
    }

    // Longest root first: the nearest workspace wins the fallback walk
    ancestors.sort_by(|a, b| b.0.cmp(&a.0));
    let chain: Vec<Ancestor> = ancestors.into_iter().map(|(_, a)| a).collect();
    debug!(?client_root, chain = chain.len(), "resolved workspace ancestors");
    Ok(chain)
}

fn is_global(workspace: &Workspace) -> bool {
    workspace.root_path == "/"
}

/// `path` relative to `base`, or `None` when `base` is not an ancestor.
/// Both are absolute `/`-separated paths.
fn relative_path(path: &str, base: &str) -> Option<String> {
    let path = path.trim_end_matches('/');
    let base = base.trim_end_matches('/');

    if base.is_empty() {
        // base was "/"
        return Some(path.trim_start_matches('/').to_string());
    }
    if path == base {
        return Some(String::new());
    }
    path.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}
