//! Plan reshaper: mutates a running plan's DAG in place (spec.md §4.3).
//!
//! Every mutation here only touches nodes in `{pending, ready}` on a
//! modifiable plan, ends with `recompute_roots_and_leaves`, and bumps
//! `state_version`. Persistence is the caller's job (the scheduler calls
//! `persistence::save` after each successful reshape).

use std::collections::{HashSet, VecDeque};

use crate::builder::{build_nodes, BuildOptions};
use crate::domain::{JobSpec, NodeId, NodeStatus, PlanInstance};
use crate::error::ReshapeError;

fn require_modifiable(plan: &PlanInstance) -> Result<(), ReshapeError> {
    if plan.is_modifiable() {
        Ok(())
    } else {
        Err(ReshapeError::PlanNotModifiable)
    }
}

fn require_node_modifiable(plan: &PlanInstance, id: NodeId) -> Result<(), ReshapeError> {
    let status = plan
        .node_states
        .get(&id)
        .ok_or_else(|| ReshapeError::NodeNotFound(id.to_string()))?
        .status;
    if matches!(status, NodeStatus::Pending | NodeStatus::Ready) {
        Ok(())
    } else {
        Err(ReshapeError::NodeNotModifiable(id.to_string()))
    }
}

fn is_dependency_available(plan: &PlanInstance, id: NodeId) -> bool {
    let Some(state) = plan.node_states.get(&id) else {
        return false;
    };
    let has_live_worktree = state.worktree_path.is_some() && !state.worktree_cleaned_up;
    let has_completed_commit = state.completed_commit.is_some();
    let still_pending_or_ready = matches!(state.status, NodeStatus::Pending | NodeStatus::Ready);
    has_live_worktree || has_completed_commit || still_pending_or_ready
}

/// Adds a new node to the plan, wiring it against `spec.dependencies`
/// (producerIds).
pub fn add_node(plan: &mut PlanInstance, spec: JobSpec) -> Result<NodeId, ReshapeError> {
    require_modifiable(plan)?;

    if plan.producer_id_to_node_id.contains_key(&spec.producer_id) {
        return Err(ReshapeError::DuplicateProducerId(spec.producer_id));
    }

    let mut dep_ids = Vec::with_capacity(spec.dependencies.len());
    for dep_producer_id in &spec.dependencies {
        let dep_id = plan
            .producer_id_to_node_id
            .get(dep_producer_id)
            .copied()
            .ok_or_else(|| ReshapeError::UnknownDependency(dep_producer_id.clone()))?;
        if !is_dependency_available(plan, dep_id) {
            return Err(ReshapeError::DependencyUnavailable(dep_producer_id.clone()));
        }
        dep_ids.push(dep_id);
    }

    let built = build_nodes(std::slice::from_ref(&spec), None);
    let (new_id, new_node) = built
        .nodes
        .into_iter()
        .next()
        .expect("build_nodes produced exactly one node");
    let mut new_node = new_node;
    new_node.dependencies = dep_ids.clone();

    for (path, group_id) in built.group_path_to_id {
        plan.group_path_to_id.entry(path).or_insert(group_id);
    }
    for (group_id, group) in built.groups {
        plan.groups.entry(group_id).or_insert(group);
    }
    if let Some(group_id) = new_node.group_id {
        if let Some(group) = plan.groups.get_mut(&group_id) {
            if !group.node_ids.contains(&new_id) {
                group.node_ids.push(new_id);
            }
        }
        plan.group_states
            .entry(group_id)
            .or_insert_with(crate::domain::GroupExecutionState::new);
    }

    for dep_id in &dep_ids {
        if let Some(dep_node) = plan.nodes.get_mut(dep_id) {
            dep_node.dependents.push(new_id);
        }
    }

    let status = if dep_ids.is_empty() {
        NodeStatus::Ready
    } else if dep_ids
        .iter()
        .all(|d| plan.node_states.get(d).map(|s| s.status == NodeStatus::Succeeded).unwrap_or(false))
    {
        NodeStatus::Ready
    } else {
        NodeStatus::Pending
    };

    plan.nodes.insert(new_id, new_node);
    plan.producer_id_to_node_id.insert(spec.producer_id, new_id);
    plan.node_states.insert(new_id, crate::domain::NodeExecutionState::new(status));

    finish_mutation(plan);
    Ok(new_id)
}

/// Removes a node, bridging predecessor/successor edges so chains are
/// preserved.
pub fn remove_node(plan: &mut PlanInstance, id: NodeId) -> Result<(), ReshapeError> {
    require_modifiable(plan)?;
    let node = plan
        .nodes
        .get(&id)
        .ok_or_else(|| ReshapeError::NodeNotFound(id.to_string()))?
        .clone();

    for dependent in &node.dependents {
        require_node_modifiable(plan, *dependent)
            .map_err(|_| ReshapeError::DependentNotModifiable(id.to_string()))?;
    }

    for pred in &node.dependencies {
        if let Some(pred_node) = plan.nodes.get_mut(pred) {
            pred_node.dependents.retain(|d| *d != id);
            for succ in &node.dependents {
                if !pred_node.dependents.contains(succ) {
                    pred_node.dependents.push(*succ);
                }
            }
        }
    }
    for succ in &node.dependents {
        if let Some(succ_node) = plan.nodes.get_mut(succ) {
            succ_node.dependencies.retain(|d| *d != id);
            for pred in &node.dependencies {
                if !succ_node.dependencies.contains(pred) {
                    succ_node.dependencies.push(*pred);
                }
            }
        }
    }

    plan.nodes.remove(&id);
    plan.node_states.remove(&id);
    plan.producer_id_to_node_id.retain(|_, v| *v != id);
    if let Some(group_id) = node.group_id {
        if let Some(group) = plan.groups.get_mut(&group_id) {
            group.node_ids.retain(|n| *n != id);
        }
    }

    recompute_downstream_statuses(plan, &node.dependents);
    finish_mutation(plan);
    Ok(())
}

/// Rewires `id`'s dependency set atomically, cycle-checked by BFS from each
/// proposed dependency walking backward through `dependencies`.
pub fn update_node_dependencies(
    plan: &mut PlanInstance,
    id: NodeId,
    new_deps: Vec<NodeId>,
) -> Result<(), ReshapeError> {
    require_modifiable(plan)?;
    require_node_modifiable(plan, id)?;

    for dep in &new_deps {
        if can_reach(plan, *dep, id) {
            return Err(ReshapeError::WouldCycle {
                from: dep.to_string(),
                to: id.to_string(),
            });
        }
    }

    let old_deps = plan
        .nodes
        .get(&id)
        .ok_or_else(|| ReshapeError::NodeNotFound(id.to_string()))?
        .dependencies
        .clone();

    for old_dep in &old_deps {
        if let Some(n) = plan.nodes.get_mut(old_dep) {
            n.dependents.retain(|d| *d != id);
        }
    }
    for new_dep in &new_deps {
        if let Some(n) = plan.nodes.get_mut(new_dep) {
            if !n.dependents.contains(&id) {
                n.dependents.push(id);
            }
        }
    }

    if let Some(node) = plan.nodes.get_mut(&id) {
        node.dependencies = new_deps.clone();
    }

    recompute_downstream_statuses(plan, &[id]);
    finish_mutation(plan);
    Ok(())
}

/// Inserts `spec` immediately before `existing_id`: the new node becomes
/// the sole upstream dependency of `existing_id`, severing its prior edges.
pub fn add_node_before(
    plan: &mut PlanInstance,
    existing_id: NodeId,
    spec: JobSpec,
) -> Result<NodeId, ReshapeError> {
    require_modifiable(plan)?;
    require_node_modifiable(plan, existing_id)?;

    if plan.producer_id_to_node_id.contains_key(&spec.producer_id) {
        return Err(ReshapeError::DuplicateProducerId(spec.producer_id));
    }

    let old_deps = plan
        .nodes
        .get(&existing_id)
        .ok_or_else(|| ReshapeError::NodeNotFound(existing_id.to_string()))?
        .dependencies
        .clone();

    let built = build_nodes(std::slice::from_ref(&spec), None);
    let (new_id, mut new_node) = built.nodes.into_iter().next().expect("exactly one node");
    new_node.dependencies = Vec::new();
    new_node.dependents = vec![existing_id];

    for old_dep in &old_deps {
        if let Some(n) = plan.nodes.get_mut(old_dep) {
            n.dependents.retain(|d| *d != existing_id);
        }
    }

    plan.nodes.insert(new_id, new_node);
    plan.producer_id_to_node_id.insert(spec.producer_id, new_id);
    plan.node_states
        .insert(new_id, crate::domain::NodeExecutionState::new(NodeStatus::Ready));

    if let Some(existing) = plan.nodes.get_mut(&existing_id) {
        existing.dependencies = vec![new_id];
    }

    recompute_downstream_statuses(plan, &[existing_id]);
    finish_mutation(plan);
    Ok(new_id)
}

/// Inserts `spec` immediately after `existing_id`: the new node depends on
/// `existing_id`, and adopts `existing_id`'s modifiable dependents.
pub fn add_node_after(
    plan: &mut PlanInstance,
    existing_id: NodeId,
    mut spec: JobSpec,
) -> Result<NodeId, ReshapeError> {
    require_modifiable(plan)?;
    plan.nodes
        .get(&existing_id)
        .ok_or_else(|| ReshapeError::NodeNotFound(existing_id.to_string()))?;

    if plan.producer_id_to_node_id.contains_key(&spec.producer_id) {
        return Err(ReshapeError::DuplicateProducerId(spec.producer_id));
    }

    let existing_producer_id = plan.nodes[&existing_id].producer_id.clone();
    if !spec.dependencies.iter().any(|d| d == &existing_producer_id) {
        spec.dependencies.push(existing_producer_id);
    }
    spec.dependencies.sort();
    spec.dependencies.dedup();

    let adopted: Vec<NodeId> = plan.nodes[&existing_id]
        .dependents
        .iter()
        .copied()
        .filter(|d| {
            plan.node_states
                .get(d)
                .map(|s| matches!(s.status, NodeStatus::Pending | NodeStatus::Ready))
                .unwrap_or(false)
        })
        .collect();

    let built = build_nodes(std::slice::from_ref(&spec), None);
    let (new_id, mut new_node) = built.nodes.into_iter().next().expect("exactly one node");
    new_node.dependencies = vec![existing_id];
    new_node.dependents = adopted.clone();

    if let Some(existing) = plan.nodes.get_mut(&existing_id) {
        existing.dependents.push(new_id);
        existing.dependents.retain(|d| !adopted.contains(d) || *d == new_id);
    }

    for dependent in &adopted {
        if let Some(d_node) = plan.nodes.get_mut(dependent) {
            for dep in d_node.dependencies.iter_mut() {
                if *dep == existing_id {
                    *dep = new_id;
                }
            }
        }
    }

    plan.nodes.insert(new_id, new_node);
    plan.producer_id_to_node_id.insert(spec.producer_id, new_id);
    plan.node_states
        .insert(new_id, crate::domain::NodeExecutionState::new(NodeStatus::Pending));

    recompute_downstream_statuses(plan, &[new_id]);
    finish_mutation(plan);
    Ok(new_id)
}

/// BFS from `start` walking `dependencies` (i.e. backward through the DAG);
/// true if `target` is reachable, meaning adding an edge `target -> start`
/// would close a cycle.
fn can_reach(plan: &PlanInstance, start: NodeId, target: NodeId) -> bool {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start);
    while let Some(current) = queue.pop_front() {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(node) = plan.nodes.get(&current) {
            queue.extend(node.dependencies.iter().copied());
        }
    }
    false
}

fn recompute_downstream_statuses(plan: &mut PlanInstance, starting: &[NodeId]) {
    let mut queue: VecDeque<NodeId> = starting.iter().copied().collect();
    let mut visited = HashSet::new();
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        let Some(node) = plan.nodes.get(&current) else {
            continue;
        };
        let deps = node.dependencies.clone();
        let dependents = node.dependents.clone();

        let is_pending_or_ready = plan
            .node_states
            .get(&current)
            .map(|s| matches!(s.status, NodeStatus::Pending | NodeStatus::Ready))
            .unwrap_or(false);
        if is_pending_or_ready {
            let all_succeeded = deps.iter().all(|d| {
                plan.node_states
                    .get(d)
                    .map(|s| s.status == NodeStatus::Succeeded)
                    .unwrap_or(false)
            });
            if let Some(state) = plan.node_states.get_mut(&current) {
                state.status = if all_succeeded {
                    NodeStatus::Ready
                } else {
                    NodeStatus::Pending
                };
            }
        }
        queue.extend(dependents);
    }
}

fn finish_mutation(plan: &mut PlanInstance) {
    plan.recompute_roots_and_leaves();
    plan.touch();
}

/// Re-exported so callers building standalone specs for `add_node*` can use
/// the same defaults the initial build used.
pub fn default_build_options() -> BuildOptions {
    BuildOptions::default()
}
