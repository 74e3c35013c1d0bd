//! `PlanInstance`: the runtime materialization of a `PlanSpec`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::group::{GroupExecutionState, GroupId, GroupInfo};
use super::node::{NodeExecutionState, NodeId, PlanNode};
use super::spec::PlanSpec;

pub type PlanId = Uuid;

/// Aggregate status of a whole plan, derived from node states plus
/// `is_paused`/`has_started` (spec.md §4.2 "Plan status derivation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Partial,
    Canceled,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Paused => "paused",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Failed => "failed",
            PlanStatus::Partial => "partial",
            PlanStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Cumulative usage/change totals across every attempt that committed
/// successfully, per spec.md §3 "plan.workSummary equals the sum of
/// jobSummary of every attempt that succeeded".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkSummary {
    pub total_commits: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_changed: u64,
}

impl WorkSummary {
    pub fn add_assign(&mut self, other: &WorkSummary) {
        self.total_commits += other.total_commits;
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
        self.files_changed += other.files_changed;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanInstance {
    pub id: PlanId,
    pub spec: PlanSpec,

    pub nodes: HashMap<NodeId, PlanNode>,
    pub node_states: HashMap<NodeId, NodeExecutionState>,
    pub producer_id_to_node_id: HashMap<String, NodeId>,

    pub roots: Vec<NodeId>,
    pub leaves: Vec<NodeId>,

    pub groups: HashMap<GroupId, GroupInfo>,
    pub group_states: HashMap<GroupId, GroupExecutionState>,
    pub group_path_to_id: HashMap<String, GroupId>,

    pub target_branch: Option<String>,
    pub base_branch: String,
    pub base_commit_at_start: Option<String>,

    pub repo_path: PathBuf,
    pub worktree_root: PathBuf,
    pub max_parallel: usize,
    pub clean_up_successful_work: bool,

    pub work_summary: WorkSummary,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_paused: bool,

    pub state_version: u64,
}

impl PlanInstance {
    pub fn touch(&mut self) -> u64 {
        self.state_version += 1;
        self.state_version
    }

    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    pub fn node_id_for_producer(&self, producer_id: &str) -> Option<NodeId> {
        self.producer_id_to_node_id.get(producer_id).copied()
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.leaves.contains(&id)
    }

    pub fn is_modifiable(&self) -> bool {
        self.ended_at.is_none() && (self.started_at.is_none() || self.is_paused)
    }

    /// Recompute `roots`/`leaves` from the current edge set. Idempotent.
    pub fn recompute_roots_and_leaves(&mut self) {
        self.roots = self
            .nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.id)
            .collect();
        self.leaves = self
            .nodes
            .values()
            .filter(|n| n.dependents.is_empty())
            .map(|n| n.id)
            .collect();
        self.roots.sort();
        self.leaves.sort();
    }
}
