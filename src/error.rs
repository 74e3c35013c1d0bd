//! Structured error types for the parts of the engine callers pattern-match on.
//!
//! Everything else propagates as `anyhow::Error` with `.context(..)`, matching
//! the teacher's split between ad-hoc I/O failures and programmatically
//! inspectable validation/reshape errors.

use thiserror::Error;

use crate::domain::PhaseName;

/// Raised by [`crate::builder::build_plan`] when a `PlanSpec` is malformed.
///
/// Carries every problem found, not just the first, so a caller can report
/// them all at once.
#[derive(Debug, Error)]
#[error("plan spec is invalid: {}", .problems.join("; "))]
pub struct PlanValidationError {
    pub problems: Vec<String>,
}

impl PlanValidationError {
    pub fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }
}

/// Raised by [`crate::reshaper`] mutations that would violate a DAG invariant
/// or touch a non-modifiable node.
#[derive(Debug, Error)]
pub enum ReshapeError {
    #[error("plan is not modifiable (already ended, or running and not paused)")]
    PlanNotModifiable,

    #[error("node '{0}' is not modifiable (status is not pending/ready)")]
    NodeNotModifiable(String),

    #[error("producer id '{0}' is already used in this plan")]
    DuplicateProducerId(String),

    #[error("unknown producer id '{0}' referenced as a dependency")]
    UnknownDependency(String),

    #[error("dependency '{from}' -> '{to}' would introduce a cycle")]
    WouldCycle { from: String, to: String },

    #[error("node '{0}' has a non-modifiable dependent and cannot be removed")]
    DependentNotModifiable(String),

    #[error("upstream dependency '{0}' is not available (no worktree, no completed commit, and not pending/ready)")]
    DependencyUnavailable(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),
}

/// A single job attempt's terminal outcome from the phase executor's point of
/// view. Not every failure here is fatal to the node — §4.5.7 may retry it
/// via auto-heal before the engine gives up and reports this upward.
#[derive(Debug, Error)]
#[error("phase '{phase}' failed: {message}")]
pub struct PhaseFailure {
    pub phase: PhaseName,
    pub message: String,
    pub exit_code: Option<i32>,
    /// Set when an agent-type phase died to a signal rather than exiting
    /// normally — the engine's auto-heal decision (spec.md §4.5.7) treats
    /// this differently from an ordinary non-zero exit.
    pub signal_killed: bool,
}

impl PhaseFailure {
    pub fn new(phase: PhaseName, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            exit_code: None,
            signal_killed: false,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_signal_killed(mut self) -> Self {
        self.signal_killed = true;
        self
    }
}
