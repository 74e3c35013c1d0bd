//! Runtime node types: one `PlanNode` per job, with mutable execution state
//! tracked separately in `NodeExecutionState`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::group::GroupId;
use super::spec::WorkSpec;

/// Unique identifier for a node within a plan.
pub type NodeId = Uuid;

/// The six phases a job attempt runs through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseName {
    MergeFi,
    Prechecks,
    Work,
    Commit,
    Postchecks,
    MergeRi,
}

impl PhaseName {
    pub const ORDER: [PhaseName; 6] = [
        PhaseName::MergeFi,
        PhaseName::Prechecks,
        PhaseName::Work,
        PhaseName::Commit,
        PhaseName::Postchecks,
        PhaseName::MergeRi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::MergeFi => "merge-fi",
            PhaseName::Prechecks => "prechecks",
            PhaseName::Work => "work",
            PhaseName::Commit => "commit",
            PhaseName::Postchecks => "postchecks",
            PhaseName::MergeRi => "merge-ri",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single phase within the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// The lifecycle status of a node. See spec.md §3 for the full transition
/// table; `state_machine.rs` is the only place allowed to move a node
/// between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Ready,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Scheduled => "scheduled",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Blocked => "blocked",
            NodeStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// A materialized job in the DAG. Immutable once built by
/// [`crate::builder::build_plan`] except through [`crate::reshaper`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: NodeId,
    pub producer_id: String,
    pub name: Option<String>,
    pub task: String,

    /// Ordered: `getBaseCommitsForNode` relies on declaration order.
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,

    pub work: Option<WorkSpec>,
    pub prechecks: Option<WorkSpec>,
    pub postchecks: Option<WorkSpec>,
    pub instructions: Option<String>,

    pub base_branch: Option<String>,
    pub expects_no_changes: bool,
    pub auto_heal: bool,

    pub group: Option<String>,
    pub group_id: Option<GroupId>,
}

/// One attempt's immutable, append-only snapshot in `attempt_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptTrigger {
    Initial,
    Retry,
    AutoHeal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub trigger_type: AttemptTrigger,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failed_phase: Option<PhaseName>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub copilot_session_id: Option<String>,
    pub step_statuses: BTreeMap<PhaseName, StepStatus>,
    pub worktree_path: PathBuf,
    pub base_commit: String,
    pub completed_commit: Option<String>,
    pub logs: String,
    pub log_file_path: Option<PathBuf>,
    pub work_used: Option<WorkSpec>,
    pub metrics: Option<crate::stats::UsageMetrics>,
    pub phase_metrics: BTreeMap<PhaseName, crate::stats::UsageMetrics>,
}

/// Everything about a node that changes as attempts run. Owned exclusively
/// by the engine for the node it describes (spec.md §3 "Ownership &
/// lifecycle").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub status: NodeStatus,
    pub version: u64,
    pub attempts: u32,

    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    pub base_commit: Option<String>,
    pub completed_commit: Option<String>,
    pub work_commit: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub worktree_cleaned_up: bool,
    pub merged_to_target: bool,

    pub consumed_by_dependents: HashSet<NodeId>,
    pub step_statuses: BTreeMap<PhaseName, StepStatus>,
    pub resume_from_phase: Option<PhaseName>,

    pub copilot_session_id: Option<String>,
    pub pid: Option<u32>,
    pub force_failed: bool,

    pub work_summary: Option<crate::stats::UsageMetrics>,
    pub aggregated_work_summary: Option<crate::stats::UsageMetrics>,

    pub attempt_history: Vec<AttemptRecord>,

    pub metrics: Option<crate::stats::UsageMetrics>,
    pub phase_metrics: BTreeMap<PhaseName, crate::stats::UsageMetrics>,

    pub error: Option<String>,
    pub last_attempt_phase: Option<PhaseName>,

    pub auto_heal_attempted: HashSet<PhaseName>,

    /// Set by `retryNode` to label the next attempt's history entry
    /// `Retry` rather than have the engine infer it from
    /// `auto_heal_attempted`. Consumed (and cleared) once that attempt
    /// finishes.
    pub next_attempt_trigger: Option<AttemptTrigger>,
}

impl NodeExecutionState {
    pub fn new(status: NodeStatus) -> Self {
        Self {
            status,
            version: 0,
            attempts: 0,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            base_commit: None,
            completed_commit: None,
            work_commit: None,
            worktree_path: None,
            worktree_cleaned_up: false,
            merged_to_target: false,
            consumed_by_dependents: HashSet::new(),
            step_statuses: BTreeMap::new(),
            resume_from_phase: None,
            copilot_session_id: None,
            pid: None,
            force_failed: false,
            work_summary: None,
            aggregated_work_summary: None,
            attempt_history: Vec::new(),
            metrics: None,
            phase_metrics: BTreeMap::new(),
            error: None,
            last_attempt_phase: None,
            auto_heal_attempted: HashSet::new(),
            next_attempt_trigger: None,
        }
    }
}
