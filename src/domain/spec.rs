//! Declarative input types: what a user submits to build a plan.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::node::PhaseName;

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Declarative description of a DAG of code-modification jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,

    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Branch that leaf nodes reverse-integrate their completed commit into.
    #[serde(default)]
    pub target_branch: Option<String>,

    pub repo_path: Option<PathBuf>,

    pub worktree_root: Option<PathBuf>,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default = "default_true")]
    pub clean_up_successful_work: bool,

    pub jobs: Vec<JobSpec>,

    /// Slash-separated group paths referenced from `JobSpec::group` are
    /// enough to build the hierarchy; this field lets a caller pre-declare
    /// empty groups too (documentation purposes, or future node additions).
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

/// A single job in a `PlanSpec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub producer_id: String,

    pub name: Option<String>,

    pub task: String,

    pub work: Option<WorkSpec>,

    pub prechecks: Option<WorkSpec>,

    pub postchecks: Option<WorkSpec>,

    pub instructions: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    pub base_branch: Option<String>,

    #[serde(default)]
    pub expects_no_changes: bool,

    #[serde(default = "default_true")]
    pub auto_heal: bool,

    /// Slash-separated group path, e.g. `"backend/migrations"`.
    pub group: Option<String>,
}

/// Declares an (initially empty) group, by slash-separated path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub path: String,
}

/// What a job phase actually runs. Tagged on `kind` when serialized so a
/// plain string in YAML/JSON can still deserialize as a bare shell command
/// (see `WorkSpec::deserialize` below via `#[serde(untagged)]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkSpec {
    Plain(String),
    Shell {
        command: String,
        shell: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        on_failure: Option<FailurePolicy>,
    },
    Process {
        executable: String,
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        on_failure: Option<FailurePolicy>,
    },
    Agent {
        instructions: String,
        model: Option<String>,
        #[serde(default)]
        allowed_folders: Vec<PathBuf>,
        #[serde(default)]
        allowed_urls: Vec<String>,
        #[serde(default)]
        resume_session: bool,
        on_failure: Option<FailurePolicy>,
    },
}

impl WorkSpec {
    /// Normalize `Plain(cmd)` into the `Shell` variant it is shorthand for.
    pub fn normalized(&self) -> std::borrow::Cow<'_, WorkSpec> {
        match self {
            WorkSpec::Plain(command) => std::borrow::Cow::Owned(WorkSpec::Shell {
                command: command.clone(),
                shell: None,
                env: HashMap::new(),
                on_failure: None,
            }),
            other => std::borrow::Cow::Borrowed(other),
        }
    }

    pub fn on_failure(&self) -> Option<&FailurePolicy> {
        match self {
            WorkSpec::Plain(_) => None,
            WorkSpec::Shell { on_failure, .. } => on_failure.as_ref(),
            WorkSpec::Process { on_failure, .. } => on_failure.as_ref(),
            WorkSpec::Agent { on_failure, .. } => on_failure.as_ref(),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, WorkSpec::Agent { .. })
    }
}

/// Per-phase override of retry/failure behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailurePolicy {
    #[serde(default)]
    pub no_auto_heal: bool,
    pub resume_from_phase: Option<PhaseName>,
    pub message: Option<String>,
}
