//! Plan builder: turns a declarative `PlanSpec` into a runtime
//! `PlanInstance` (spec.md §4.1).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    GroupExecutionState, GroupId, GroupInfo, JobSpec, NodeExecutionState, NodeId, NodeStatus,
    PlanInstance, PlanNode, PlanSpec, WorkSummary,
};
use crate::error::PlanValidationError;

/// Extra knobs not carried on the spec itself.
#[derive(Debug, Default, Clone)]
pub struct BuildOptions {
    pub repo_path: Option<PathBuf>,
    pub worktree_root: Option<PathBuf>,
}

/// Nodes plus the group hierarchy they reference, without a wrapping plan —
/// used by `reshaper` to materialize new nodes for insertion into an
/// existing plan.
pub struct BuiltNodes {
    pub nodes: HashMap<NodeId, PlanNode>,
    pub producer_id_to_node_id: HashMap<String, NodeId>,
    pub groups: HashMap<GroupId, GroupInfo>,
    pub group_path_to_id: HashMap<String, GroupId>,
}

pub fn build_plan(
    spec: PlanSpec,
    options: BuildOptions,
) -> Result<PlanInstance, PlanValidationError> {
    validate(&spec)?;

    let repo_path = options
        .repo_path
        .or_else(|| spec.repo_path.clone())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let worktree_root = options
        .worktree_root
        .or_else(|| spec.worktree_root.clone())
        .unwrap_or_else(|| repo_path.join(".railyard").join("worktrees"));

    let mut built = build_nodes(&spec.jobs, None);
    for group_spec in &spec.groups {
        ensure_group_path(&group_spec.path, &mut built.groups, &mut built.group_path_to_id);
    }

    let mut node_states = HashMap::new();
    for node in built.nodes.values() {
        let status = if node.dependencies.is_empty() {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };
        node_states.insert(node.id, NodeExecutionState::new(status));
    }

    recompute_all_node_ids(&mut built.groups);

    let group_states = built
        .groups
        .keys()
        .map(|id| (*id, GroupExecutionState::new()))
        .collect();

    let mut roots: Vec<NodeId> = built
        .nodes
        .values()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.id)
        .collect();
    roots.sort();
    let mut leaves: Vec<NodeId> = built
        .nodes
        .values()
        .filter(|n| n.dependents.is_empty())
        .map(|n| n.id)
        .collect();
    leaves.sort();

    Ok(PlanInstance {
        id: Uuid::new_v4(),
        base_branch: spec.base_branch.clone(),
        target_branch: spec.target_branch.clone(),
        max_parallel: spec.max_parallel,
        clean_up_successful_work: spec.clean_up_successful_work,
        spec,
        nodes: built.nodes,
        node_states,
        producer_id_to_node_id: built.producer_id_to_node_id,
        roots,
        leaves,
        groups: built.groups,
        group_states,
        group_path_to_id: built.group_path_to_id,
        base_commit_at_start: None,
        repo_path,
        worktree_root,
        work_summary: WorkSummary::default(),
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        is_paused: false,
        state_version: 0,
    })
}

/// Convenience for the common case of a plan with exactly one job.
pub fn build_single_job_plan(
    job: JobSpec,
    name: impl Into<String>,
    options: BuildOptions,
) -> Result<PlanInstance, PlanValidationError> {
    let spec = PlanSpec {
        name: name.into(),
        base_branch: "main".to_string(),
        target_branch: None,
        repo_path: options.repo_path.clone(),
        worktree_root: options.worktree_root.clone(),
        max_parallel: 4,
        clean_up_successful_work: true,
        jobs: vec![job],
        groups: Vec::new(),
    };
    build_plan(spec, options)
}

/// Build nodes (with dep/dependent edges and group assignment) without
/// wrapping them in a `PlanInstance`. Used standalone by the builder and by
/// `reshaper::add_node` to materialize one new node at a time.
pub fn build_nodes(specs: &[JobSpec], existing_producer_ids: Option<&HashSet<String>>) -> BuiltNodes {
    let _ = existing_producer_ids;

    let mut producer_id_to_node_id = HashMap::new();
    for spec in specs {
        producer_id_to_node_id.insert(spec.producer_id.clone(), Uuid::new_v4());
    }

    let mut groups: HashMap<GroupId, GroupInfo> = HashMap::new();
    let mut group_path_to_id: HashMap<String, GroupId> = HashMap::new();

    let mut nodes = HashMap::new();
    for spec in specs {
        let id = producer_id_to_node_id[&spec.producer_id];
        let dependencies: Vec<NodeId> = spec
            .dependencies
            .iter()
            .filter_map(|dep| producer_id_to_node_id.get(dep).copied())
            .collect();

        let group_id = spec
            .group
            .as_ref()
            .map(|path| ensure_group_path(path, &mut groups, &mut group_path_to_id));

        if let Some(gid) = group_id {
            groups.get_mut(&gid).expect("just ensured").node_ids.push(id);
        }

        nodes.insert(
            id,
            PlanNode {
                id,
                producer_id: spec.producer_id.clone(),
                name: spec.name.clone(),
                task: spec.task.clone(),
                dependencies,
                dependents: Vec::new(),
                work: spec.work.clone(),
                prechecks: spec.prechecks.clone(),
                postchecks: spec.postchecks.clone(),
                instructions: spec.instructions.clone(),
                base_branch: spec.base_branch.clone(),
                expects_no_changes: spec.expects_no_changes,
                auto_heal: spec.auto_heal,
                group: spec.group.clone(),
                group_id,
            },
        );
    }

    // Wire reverse edges (`dependents`) symmetrically.
    let edges: Vec<(NodeId, NodeId)> = nodes
        .values()
        .flat_map(|n| n.dependencies.iter().map(move |dep| (*dep, n.id)))
        .collect();
    for (dep, dependent) in edges {
        if let Some(dep_node) = nodes.get_mut(&dep) {
            dep_node.dependents.push(dependent);
        }
    }

    BuiltNodes {
        nodes,
        producer_id_to_node_id,
        groups,
        group_path_to_id,
    }
}

/// Find or create every group along a slash-separated path, wiring
/// parent/child links as it goes. Returns the id of the final (leaf-most)
/// path segment.
pub fn ensure_group_path(
    path: &str,
    groups: &mut HashMap<GroupId, GroupInfo>,
    group_path_to_id: &mut HashMap<String, GroupId>,
) -> GroupId {
    let mut parent_id: Option<GroupId> = None;
    let mut current_path = String::new();

    for segment in path.split('/') {
        if !current_path.is_empty() {
            current_path.push('/');
        }
        current_path.push_str(segment);

        let id = if let Some(existing) = group_path_to_id.get(&current_path) {
            *existing
        } else {
            let info = GroupInfo::new(current_path.clone(), parent_id);
            let id = info.id;
            if let Some(parent) = parent_id {
                groups.get_mut(&parent).expect("parent exists").child_group_ids.push(id);
            }
            groups.insert(id, info);
            group_path_to_id.insert(current_path.clone(), id);
            id
        };
        parent_id = Some(id);
    }

    parent_id.expect("path has at least one segment")
}

fn transitive_node_ids(group: &GroupInfo, groups: &HashMap<GroupId, GroupInfo>) -> HashSet<NodeId> {
    let mut result: HashSet<NodeId> = group.node_ids.iter().copied().collect();
    for child_id in &group.child_group_ids {
        if let Some(child) = groups.get(child_id) {
            result.extend(transitive_node_ids(child, groups));
        }
    }
    result
}

fn recompute_all_node_ids(groups: &mut HashMap<GroupId, GroupInfo>) {
    let snapshot = groups.clone();
    for group in groups.values_mut() {
        group.all_node_ids = transitive_node_ids(group, &snapshot);
    }
}

fn validate(spec: &PlanSpec) -> Result<(), PlanValidationError> {
    let mut problems = Vec::new();

    if spec.jobs.is_empty() {
        problems.push("plan must contain at least one job".to_string());
        return Err(PlanValidationError { problems });
    }

    let mut seen_ids = HashSet::new();
    for (index, job) in spec.jobs.iter().enumerate() {
        if job.producer_id.trim().is_empty() {
            problems.push(format!("job at index {index} has an empty producerId"));
            continue;
        }
        if !seen_ids.insert(job.producer_id.clone()) {
            problems.push(format!("duplicate producerId '{}'", job.producer_id));
        }
    }

    let known_ids: HashSet<&str> = spec.jobs.iter().map(|j| j.producer_id.as_str()).collect();
    for job in &spec.jobs {
        for dep in &job.dependencies {
            if !known_ids.contains(dep.as_str()) {
                problems.push(format!(
                    "job '{}' depends on unknown producerId '{}'",
                    job.producer_id, dep
                ));
            }
        }
    }

    if !problems.is_empty() {
        return Err(PlanValidationError { problems });
    }

    if let Some(cycle) = find_cycle(&spec.jobs) {
        problems.push(format!("dependency cycle detected: {}", cycle.join(" -> ")));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PlanValidationError { problems })
    }
}

fn find_cycle(jobs: &[JobSpec]) -> Option<Vec<String>> {
    let adjacency: HashMap<&str, &[String]> = jobs
        .iter()
        .map(|j| (j.producer_id.as_str(), j.dependencies.as_slice()))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(Mark::Done) = marks.get(node) {
            return None;
        }
        if let Some(pos) = stack.iter().position(|n| *n == node) {
            return Some(stack[pos..].iter().map(|s| s.to_string()).collect());
        }
        stack.push(node);
        if let Some(deps) = adjacency.get(node) {
            for dep in deps.iter() {
                if let Some(cycle) = visit(dep.as_str(), adjacency, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for job in jobs {
        if let Some(cycle) = visit(job.producer_id.as_str(), &adjacency, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkSpec;

    fn job(producer_id: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            producer_id: producer_id.to_string(),
            name: None,
            task: "do something".to_string(),
            work: Some(WorkSpec::Plain("true".to_string())),
            prechecks: None,
            postchecks: None,
            instructions: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            base_branch: None,
            expects_no_changes: false,
            auto_heal: true,
            group: None,
        }
    }

    #[test]
    fn builds_roots_and_leaves() {
        let spec = PlanSpec {
            name: "test".to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            repo_path: None,
            worktree_root: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs: vec![job("a", &[]), job("b", &["a"])],
            groups: vec![],
        };
        let plan = build_plan(spec, BuildOptions::default()).unwrap();
        assert_eq!(plan.roots.len(), 1);
        assert_eq!(plan.leaves.len(), 1);
        let a_id = plan.node_id_for_producer("a").unwrap();
        let b_id = plan.node_id_for_producer("b").unwrap();
        assert_eq!(plan.node_states[&a_id].status, NodeStatus::Ready);
        assert_eq!(plan.node_states[&b_id].status, NodeStatus::Pending);
    }

    #[test]
    fn rejects_empty_jobs() {
        let spec = PlanSpec {
            name: "empty".to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            repo_path: None,
            worktree_root: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs: vec![],
            groups: vec![],
        };
        assert!(build_plan(spec, BuildOptions::default()).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let spec = PlanSpec {
            name: "bad-dep".to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            repo_path: None,
            worktree_root: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs: vec![job("a", &["ghost"])],
            groups: vec![],
        };
        let err = build_plan(spec, BuildOptions::default()).unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("ghost")));
    }

    #[test]
    fn rejects_cycle() {
        let spec = PlanSpec {
            name: "cyclic".to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            repo_path: None,
            worktree_root: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs: vec![job("a", &["b"]), job("b", &["a"])],
            groups: vec![],
        };
        assert!(build_plan(spec, BuildOptions::default()).is_err());
    }

    #[test]
    fn groups_nodes_by_slash_path() {
        let mut a = job("a", &[]);
        a.group = Some("backend/migrations".to_string());
        let spec = PlanSpec {
            name: "grouped".to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            repo_path: None,
            worktree_root: None,
            max_parallel: 4,
            clean_up_successful_work: true,
            jobs: vec![a],
            groups: vec![],
        };
        let plan = build_plan(spec, BuildOptions::default()).unwrap();
        assert_eq!(plan.groups.len(), 2);
        let leaf_group = plan.group_path_to_id.get("backend/migrations").unwrap();
        assert_eq!(plan.groups[leaf_group].node_ids.len(), 1);
        let root_group = plan.group_path_to_id.get("backend").unwrap();
        assert_eq!(plan.groups[root_group].child_group_ids.len(), 1);
    }
}
