//! Core data model: plan specs, runtime nodes/groups, and their states.

mod group;
mod node;
mod plan;
mod spec;

pub use group::{GroupExecutionState, GroupId, GroupInfo, GroupStatus};
pub use node::{
    AttemptRecord, AttemptTrigger, NodeExecutionState, NodeId, NodeStatus, PhaseName, PlanNode,
    StepStatus,
};
pub use plan::{PlanId, PlanInstance, PlanStatus, WorkSummary};
pub use spec::{FailurePolicy, GroupSpec, JobSpec, PlanSpec, WorkSpec};
