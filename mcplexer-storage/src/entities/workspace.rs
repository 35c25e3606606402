//! Workspace entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{route_rule::RoutePolicy, RecordSource};

/// A routing scope anchored at a filesystem root.
///
/// Workspaces are unique by id and by name. The `default_policy` applies
/// when no route rule matches a call inside this workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,

    /// Human-readable unique name
    pub name: String,

    /// Absolute filesystem root this workspace is anchored at
    pub root_path: String,

    /// Policy applied when no rule matches
    pub default_policy: RoutePolicy,

    #[serde(default)]
    pub source: RecordSource,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Construct a new workspace with a fresh id and current timestamps
    pub fn new(name: impl Into<String>, root_path: impl Into<String>, default_policy: RoutePolicy) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.into(),
            root_path: root_path.into(),
            default_policy,
            source: RecordSource::Api,
            created_at: now,
            updated_at: now,
        }
    }
}
