//! `PlanStateMachine`: the single source of truth for node and group
//! status (spec.md §4.2). Implemented as a pure validation function
//! (`is_valid_transition`) plus an imperative apply-and-side-effect stage,
//! per spec.md §9's design note.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;

use crate::domain::{
    GroupId, GroupStatus, NodeId, NodeStatus, PlanInstance, PlanStatus,
};
use crate::events::{EngineEvent, EventBus, NodeTransitionEvent};

/// Partial update applied atomically alongside a transition.
#[derive(Debug, Default, Clone)]
pub struct NodeUpdate {
    pub error: Option<String>,
    pub completed_commit: Option<String>,
    pub base_commit: Option<String>,
}

/// Pure validation: is `from -> to` an allowed move? (spec.md §3 table)
pub fn is_valid_transition(from: NodeStatus, to: NodeStatus) -> bool {
    use NodeStatus::*;
    matches!(
        (from, to),
        (Pending, Ready) | (Pending, Blocked) | (Pending, Canceled)
            | (Ready, Scheduled) | (Ready, Blocked) | (Ready, Canceled)
            | (Scheduled, Running) | (Scheduled, Canceled)
            | (Running, Succeeded) | (Running, Failed) | (Running, Canceled)
            | (Blocked, Pending)
    )
}

pub struct PlanStateMachine {
    events: Arc<EventBus>,
}

impl PlanStateMachine {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    /// Validate and apply a transition, running every side effect described
    /// in spec.md §4.2. Returns `false` (and logs, never panics) if the
    /// transition is invalid; the plan is left unchanged in that case.
    pub fn transition(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        new_status: NodeStatus,
        updates: NodeUpdate,
    ) -> bool {
        let Some(node_state) = plan.node_states.get(&node_id) else {
            tracing::error!(%node_id, "transition on unknown node rejected");
            return false;
        };
        let from = node_state.status;

        if !is_valid_transition(from, new_status) {
            tracing::error!(%node_id, ?from, ?new_status, "invalid node transition rejected");
            return false;
        }

        let now = Utc::now();
        {
            let state = plan
                .node_states
                .get_mut(&node_id)
                .expect("checked above");
            state.status = new_status;
            if let Some(err) = updates.error {
                state.error = Some(err);
            }
            if let Some(commit) = updates.completed_commit {
                state.completed_commit = Some(commit);
            }
            if let Some(commit) = updates.base_commit {
                state.base_commit = Some(commit);
            }
            if new_status == NodeStatus::Scheduled && state.scheduled_at.is_none() {
                state.scheduled_at = Some(now);
            }
            if new_status == NodeStatus::Running && state.started_at.is_none() {
                state.started_at = Some(now);
            }
            if new_status.is_terminal() && state.ended_at.is_none() {
                state.ended_at = Some(now);
            }
            state.version += 1;
        }
        plan.touch();

        self.events.publish(EngineEvent::NodeTransition(NodeTransitionEvent {
            plan_id: plan.id,
            node_id,
            from,
            to: new_status,
            timestamp: now,
            reason: None,
        }));

        self.run_side_effects(plan, node_id, from, new_status);
        true
    }

    fn run_side_effects(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        _from: NodeStatus,
        to: NodeStatus,
    ) {
        if to == NodeStatus::Succeeded {
            let dependents = plan
                .nodes
                .get(&node_id)
                .map(|n| n.dependents.clone())
                .unwrap_or_default();
            for dependent in dependents {
                let all_deps_succeeded = plan
                    .nodes
                    .get(&dependent)
                    .map(|n| {
                        n.dependencies.iter().all(|dep| {
                            plan.node_states
                                .get(dep)
                                .map(|s| s.status == NodeStatus::Succeeded)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                let is_pending = plan
                    .node_states
                    .get(&dependent)
                    .map(|s| s.status == NodeStatus::Pending)
                    .unwrap_or(false);
                if all_deps_succeeded && is_pending {
                    self.transition(plan, dependent, NodeStatus::Ready, NodeUpdate::default());
                    self.events.publish(EngineEvent::NodeReady {
                        plan_id: plan.id,
                        node_id: dependent,
                    });
                }
            }
        }

        if to == NodeStatus::Failed {
            self.block_downstream(plan, node_id);
        }

        if to.is_terminal() {
            if let Some(status) = self.check_plan_completion(plan) {
                if plan.ended_at.is_none() {
                    plan.ended_at = Some(Utc::now());
                    self.events.publish(EngineEvent::PlanCompleted(
                        crate::events::PlanCompletionEvent {
                            plan_id: plan.id,
                            status,
                            ended_at: plan.ended_at.unwrap(),
                        },
                    ));
                }
            }
        }

        if let Some(group_id) = plan.nodes.get(&node_id).and_then(|n| n.group_id) {
            self.recompute_group_state(plan, group_id);
        }
    }

    fn block_downstream(&self, plan: &mut PlanInstance, failed_node: NodeId) {
        let failed_name = plan
            .nodes
            .get(&failed_node)
            .map(|n| n.name.clone().unwrap_or_else(|| n.producer_id.clone()))
            .unwrap_or_else(|| failed_node.to_string());

        let mut queue: VecDeque<NodeId> = plan
            .nodes
            .get(&failed_node)
            .map(|n| n.dependents.clone().into())
            .unwrap_or_default();
        let mut visited = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let is_terminal = plan
                .node_states
                .get(&current)
                .map(|s| s.status.is_terminal())
                .unwrap_or(true);
            if !is_terminal {
                let message = format!("Blocked: dependency '{}' failed", failed_name);
                self.transition(
                    plan,
                    current,
                    NodeStatus::Blocked,
                    NodeUpdate {
                        error: Some(message),
                        ..Default::default()
                    },
                );
            }
            if let Some(node) = plan.nodes.get(&current) {
                queue.extend(node.dependents.iter().copied());
            }
        }
    }

    /// Bypasses normal transition validation for retry: resets a node to
    /// `ready` (if all deps succeeded) or `pending`, then walks downstream
    /// un-blocking nodes whose only blocker was this one.
    pub fn reset_node_to_pending(&self, plan: &mut PlanInstance, node_id: NodeId) {
        let all_deps_succeeded = plan
            .nodes
            .get(&node_id)
            .map(|n| {
                n.dependencies.iter().all(|dep| {
                    plan.node_states
                        .get(dep)
                        .map(|s| s.status == NodeStatus::Succeeded)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(true);

        let new_status = if all_deps_succeeded {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };

        let now = Utc::now();
        let from = plan
            .node_states
            .get(&node_id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Failed);

        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.status = new_status;
            state.error = None;
            state.ended_at = None;
            state.started_at = None;
            state.version += 1;
        }
        plan.touch();

        self.events.publish(EngineEvent::NodeTransition(NodeTransitionEvent {
            plan_id: plan.id,
            node_id,
            from,
            to: new_status,
            timestamp: now,
            reason: Some("retry".to_string()),
        }));

        if plan.ended_at.is_some() {
            plan.ended_at = None;
        }

        self.unblock_downstream(plan, node_id);

        if let Some(group_id) = plan.nodes.get(&node_id).and_then(|n| n.group_id) {
            self.recompute_group_state(plan, group_id);
        }
    }

    fn unblock_downstream(&self, plan: &mut PlanInstance, node_id: NodeId) {
        let mut queue: VecDeque<NodeId> = plan
            .nodes
            .get(&node_id)
            .map(|n| n.dependents.clone().into())
            .unwrap_or_default();
        let mut visited = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let is_blocked = plan
                .node_states
                .get(&current)
                .map(|s| s.status == NodeStatus::Blocked)
                .unwrap_or(false);

            if is_blocked {
                let still_blocked = plan
                    .nodes
                    .get(&current)
                    .map(|n| {
                        n.dependencies.iter().any(|dep| {
                            plan.node_states
                                .get(dep)
                                .map(|s| matches!(s.status, NodeStatus::Failed | NodeStatus::Blocked))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);

                if !still_blocked {
                    let now = Utc::now();
                    if let Some(state) = plan.node_states.get_mut(&current) {
                        state.status = NodeStatus::Pending;
                        state.error = None;
                        state.version += 1;
                    }
                    plan.touch();
                    self.events.publish(EngineEvent::NodeTransition(NodeTransitionEvent {
                        plan_id: plan.id,
                        node_id: current,
                        from: NodeStatus::Blocked,
                        to: NodeStatus::Pending,
                        timestamp: now,
                        reason: Some("upstream retried".to_string()),
                    }));
                    if let Some(node) = plan.nodes.get(&current) {
                        queue.extend(node.dependents.iter().copied());
                    }
                }
            } else if let Some(node) = plan.nodes.get(&current) {
                queue.extend(node.dependents.iter().copied());
            }
        }
    }

    /// Dependency commits in declaration order: `[0]` is the base, the rest
    /// are additional FI sources (spec.md §4.2).
    pub fn get_base_commits_for_node(&self, plan: &PlanInstance, node_id: NodeId) -> Vec<String> {
        let Some(node) = plan.nodes.get(&node_id) else {
            return Vec::new();
        };
        node.dependencies
            .iter()
            .filter_map(|dep| {
                plan.node_states
                    .get(dep)
                    .and_then(|s| s.completed_commit.clone())
            })
            .collect()
    }

    /// Transitions every non-terminal node to `canceled`.
    pub fn cancel_all(&self, plan: &mut PlanInstance) {
        let node_ids: Vec<NodeId> = plan.nodes.keys().copied().collect();
        for node_id in node_ids {
            let is_terminal = plan
                .node_states
                .get(&node_id)
                .map(|s| s.status.is_terminal())
                .unwrap_or(true);
            if !is_terminal {
                self.transition(plan, node_id, NodeStatus::Canceled, NodeUpdate::default());
            }
        }
    }

    fn check_plan_completion(&self, plan: &PlanInstance) -> Option<PlanStatus> {
        let status = self.derive_plan_status(plan);
        if matches!(status, PlanStatus::Pending | PlanStatus::Running | PlanStatus::Paused) {
            None
        } else {
            Some(status)
        }
    }

    /// Plan status derivation (spec.md §4.2).
    pub fn derive_plan_status(&self, plan: &PlanInstance) -> PlanStatus {
        let statuses: Vec<NodeStatus> = plan.node_states.values().map(|s| s.status).collect();
        let has_started = plan.started_at.is_some();

        let any_non_terminal = statuses.iter().any(|s| !s.is_terminal());
        if plan.is_paused && any_non_terminal {
            return PlanStatus::Paused;
        }

        if statuses
            .iter()
            .any(|s| matches!(s, NodeStatus::Running | NodeStatus::Scheduled))
        {
            return PlanStatus::Running;
        }

        if statuses
            .iter()
            .any(|s| matches!(s, NodeStatus::Ready | NodeStatus::Pending))
        {
            return if has_started {
                PlanStatus::Running
            } else {
                PlanStatus::Pending
            };
        }

        // All terminal.
        if statuses.iter().any(|s| *s == NodeStatus::Canceled) {
            return PlanStatus::Canceled;
        }
        let any_succeeded = statuses.iter().any(|s| *s == NodeStatus::Succeeded);
        let any_failed_or_blocked = statuses
            .iter()
            .any(|s| matches!(s, NodeStatus::Failed | NodeStatus::Blocked));
        match (any_succeeded, any_failed_or_blocked) {
            (true, true) => PlanStatus::Partial,
            (false, true) => PlanStatus::Failed,
            _ => PlanStatus::Succeeded,
        }
    }

    /// Recompute a group's aggregate status from its direct members (child
    /// nodes + child groups, each one entity), then propagate to the
    /// parent recursively (spec.md §4.2 "Group aggregation").
    pub fn recompute_group_state(&self, plan: &mut PlanInstance, group_id: GroupId) {
        let Some(group) = plan.groups.get(&group_id).cloned() else {
            return;
        };

        #[derive(Clone, Copy)]
        struct Member {
            running_or_scheduled: bool,
            failed_or_blocked: bool,
            terminal: bool,
            succeeded: bool,
            canceled: bool,
            started: bool,
            ended_at: Option<chrono::DateTime<Utc>>,
        }

        let mut members = Vec::new();
        for node_id in &group.node_ids {
            if let Some(s) = plan.node_states.get(node_id) {
                members.push(Member {
                    running_or_scheduled: matches!(s.status, NodeStatus::Running | NodeStatus::Scheduled),
                    failed_or_blocked: matches!(s.status, NodeStatus::Failed | NodeStatus::Blocked),
                    terminal: s.status.is_terminal(),
                    succeeded: s.status == NodeStatus::Succeeded,
                    canceled: s.status == NodeStatus::Canceled,
                    started: s.started_at.is_some(),
                    ended_at: s.ended_at,
                });
            }
        }
        for child_group_id in &group.child_group_ids {
            if let Some(s) = plan.group_states.get(child_group_id) {
                let terminal = matches!(
                    s.status,
                    GroupStatus::Succeeded | GroupStatus::Failed | GroupStatus::Canceled
                );
                members.push(Member {
                    running_or_scheduled: s.status == GroupStatus::Running,
                    failed_or_blocked: s.status == GroupStatus::Failed,
                    terminal,
                    succeeded: s.status == GroupStatus::Succeeded,
                    canceled: s.status == GroupStatus::Canceled,
                    started: s.started_at.is_some(),
                    ended_at: s.ended_at,
                });
            }
        }

        let new_status;
        let mut new_ended_at = None;

        if members.iter().any(|m| m.running_or_scheduled) {
            new_status = GroupStatus::Running;
        } else if members.iter().any(|m| m.failed_or_blocked) {
            new_status = GroupStatus::Failed;
            if members.iter().all(|m| m.terminal) {
                new_ended_at = Some(
                    members
                        .iter()
                        .filter_map(|m| m.ended_at)
                        .max()
                        .unwrap_or_else(Utc::now),
                );
            }
        } else if !members.is_empty() && members.iter().all(|m| m.terminal) {
            if members.iter().all(|m| m.succeeded) {
                new_status = GroupStatus::Succeeded;
            } else if members.iter().all(|m| m.canceled) {
                new_status = GroupStatus::Canceled;
            } else {
                new_status = GroupStatus::Failed;
            }
            new_ended_at = Some(
                members
                    .iter()
                    .filter_map(|m| m.ended_at)
                    .max()
                    .unwrap_or_else(Utc::now),
            );
        } else if members.iter().any(|m| m.started) {
            new_status = GroupStatus::Running;
        } else {
            new_status = GroupStatus::Pending;
        }

        let Some(state) = plan.group_states.get_mut(&group_id) else {
            return;
        };
        let changed = state.status != new_status || state.ended_at != new_ended_at;
        if changed {
            state.status = new_status;
            if new_status == GroupStatus::Running {
                state.ended_at = None;
                if state.started_at.is_none() {
                    state.started_at = Some(Utc::now());
                }
            } else {
                state.ended_at = new_ended_at;
            }
            state.version += 1;
            plan.touch();
            self.events.publish(EngineEvent::GroupTransition {
                plan_id: plan.id,
                group_id,
                to: new_status,
            });
        }

        if let Some(parent_id) = group.parent_group_id {
            self.recompute_group_state(plan, parent_id);
        }
    }
}
