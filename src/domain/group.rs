//! Group hierarchy: slash-path-addressable collections of nodes, with
//! status derived by aggregation (spec.md §4.2).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;

pub type GroupId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Running => "running",
            GroupStatus::Succeeded => "succeeded",
            GroupStatus::Failed => "failed",
            GroupStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// A node in the group hierarchy. `node_ids` holds only directly-assigned
/// nodes; `all_node_ids` is the transitive closure, recomputed lazily
/// rather than kept perpetually in sync (spec.md §9 "derive transitive
/// membership lazily").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: GroupId,
    pub path: String,
    pub name: String,
    pub parent_group_id: Option<GroupId>,
    pub child_group_ids: Vec<GroupId>,
    pub node_ids: Vec<NodeId>,
    pub all_node_ids: HashSet<NodeId>,
}

impl GroupInfo {
    pub fn new(path: String, parent_group_id: Option<GroupId>) -> Self {
        let name = path
            .rsplit('/')
            .next()
            .unwrap_or(&path)
            .to_string();
        Self {
            id: Uuid::new_v4(),
            path,
            name,
            parent_group_id,
            child_group_ids: Vec::new(),
            node_ids: Vec::new(),
            all_node_ids: HashSet::new(),
        }
    }
}

/// Mutable aggregate status for a group, mirroring `NodeExecutionState`'s
/// shape for nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupExecutionState {
    pub status: GroupStatus,
    pub version: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GroupExecutionState {
    pub fn new() -> Self {
        Self {
            status: GroupStatus::Pending,
            version: 0,
            started_at: None,
            ended_at: None,
        }
    }
}

impl Default for GroupExecutionState {
    fn default() -> Self {
        Self::new()
    }
}
