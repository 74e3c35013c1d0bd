//! Atomic per-plan JSON snapshots (spec.md §4.7).
//!
//! One file per plan, named `plan-<planId>.json`, written with the same
//! lock-then-temp-file-then-rename pattern the teacher uses for its TOML
//! config (`config/io.rs::save_to_file`). Maps are re-encoded through
//! `serde_json`'s `preserve_order` off — `BTreeMap`/sorted-key wrapping is
//! applied explicitly below so two saves of an unchanged plan produce byte
//! identical output.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::domain::{GroupExecutionState, GroupId, GroupInfo, NodeExecutionState, NodeId, PlanInstance, PlanNode};

/// On-disk shape of a `PlanInstance`: identical fields, but every
/// `HashMap` becomes a `BTreeMap` so serialization is key-sorted and
/// diffable (spec.md §4.7 "Maps are encoded deterministically").
#[derive(Debug, Serialize, Deserialize)]
struct PlanSnapshot {
    id: crate::domain::PlanId,
    spec: crate::domain::PlanSpec,

    nodes: BTreeMap<NodeId, PlanNode>,
    node_states: BTreeMap<NodeId, NodeExecutionState>,
    producer_id_to_node_id: BTreeMap<String, NodeId>,

    roots: Vec<NodeId>,
    leaves: Vec<NodeId>,

    groups: BTreeMap<GroupId, GroupInfo>,
    group_states: BTreeMap<GroupId, GroupExecutionState>,
    group_path_to_id: BTreeMap<String, GroupId>,

    target_branch: Option<String>,
    base_branch: String,
    base_commit_at_start: Option<String>,

    repo_path: PathBuf,
    worktree_root: PathBuf,
    max_parallel: usize,
    clean_up_successful_work: bool,

    work_summary: crate::domain::WorkSummary,

    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    is_paused: bool,

    state_version: u64,
}

impl From<&PlanInstance> for PlanSnapshot {
    fn from(plan: &PlanInstance) -> Self {
        Self {
            id: plan.id,
            spec: plan.spec.clone(),
            nodes: plan.nodes.iter().map(|(k, v)| (*k, v.clone())).collect(),
            node_states: plan.node_states.iter().map(|(k, v)| (*k, v.clone())).collect(),
            producer_id_to_node_id: plan.producer_id_to_node_id.clone().into_iter().collect(),
            roots: plan.roots.clone(),
            leaves: plan.leaves.clone(),
            groups: plan.groups.iter().map(|(k, v)| (*k, v.clone())).collect(),
            group_states: plan.group_states.iter().map(|(k, v)| (*k, v.clone())).collect(),
            group_path_to_id: plan.group_path_to_id.clone().into_iter().collect(),
            target_branch: plan.target_branch.clone(),
            base_branch: plan.base_branch.clone(),
            base_commit_at_start: plan.base_commit_at_start.clone(),
            repo_path: plan.repo_path.clone(),
            worktree_root: plan.worktree_root.clone(),
            max_parallel: plan.max_parallel,
            clean_up_successful_work: plan.clean_up_successful_work,
            work_summary: plan.work_summary.clone(),
            created_at: plan.created_at,
            started_at: plan.started_at,
            ended_at: plan.ended_at,
            is_paused: plan.is_paused,
            state_version: plan.state_version,
        }
    }
}

impl From<PlanSnapshot> for PlanInstance {
    fn from(s: PlanSnapshot) -> Self {
        PlanInstance {
            id: s.id,
            spec: s.spec,
            nodes: s.nodes.into_iter().collect(),
            node_states: s.node_states.into_iter().collect(),
            producer_id_to_node_id: s.producer_id_to_node_id.into_iter().collect(),
            roots: s.roots,
            leaves: s.leaves,
            groups: s.groups.into_iter().collect(),
            group_states: s.group_states.into_iter().collect(),
            group_path_to_id: s.group_path_to_id.into_iter().collect(),
            target_branch: s.target_branch,
            base_branch: s.base_branch,
            base_commit_at_start: s.base_commit_at_start,
            repo_path: s.repo_path,
            worktree_root: s.worktree_root,
            max_parallel: s.max_parallel,
            clean_up_successful_work: s.clean_up_successful_work,
            work_summary: s.work_summary,
            created_at: s.created_at,
            started_at: s.started_at,
            ended_at: s.ended_at,
            is_paused: s.is_paused,
            state_version: s.state_version,
        }
    }
}

pub fn snapshot_file_name(plan_id: crate::domain::PlanId) -> String {
    format!("plan-{}.json", plan_id)
}

pub fn snapshot_path(store_dir: &Path, plan_id: crate::domain::PlanId) -> PathBuf {
    store_dir.join(snapshot_file_name(plan_id))
}

/// Write `plan`'s snapshot atomically: exclusive-lock a sidecar `.lock`
/// file, write to a `.tmp` file, `fsync`, then rename over the final path.
pub fn save(store_dir: &Path, plan: &PlanInstance) -> Result<()> {
    std::fs::create_dir_all(store_dir)
        .with_context(|| format!("Failed to create plan store directory: {}", store_dir.display()))?;

    let path = snapshot_path(store_dir, plan.id);
    let snapshot = PlanSnapshot::from(plan);
    let content = serde_json::to_string_pretty(&snapshot).context("Failed to serialize plan snapshot")?;

    let lock_path = path.with_extension("json.lock");
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| "Failed to acquire plan snapshot lock")?;

    let temp_path = path.with_extension("json.tmp");
    let mut temp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    temp_file
        .write_all(content.as_bytes())
        .context("Failed to write plan snapshot content")?;
    temp_file.sync_all().context("Failed to sync plan snapshot file")?;

    std::fs::rename(&temp_path, &path)
        .with_context(|| format!("Failed to rename plan snapshot into place: {}", path.display()))?;

    Ok(())
}

pub fn load(store_dir: &Path, plan_id: crate::domain::PlanId) -> Result<PlanInstance> {
    let path = snapshot_path(store_dir, plan_id);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read plan snapshot: {}", path.display()))?;
    let snapshot: PlanSnapshot =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse plan snapshot: {}", path.display()))?;
    Ok(snapshot.into())
}

/// Every plan id with a snapshot currently on disk, derived from file
/// names (`plan-<uuid>.json`).
pub fn list_plan_ids(store_dir: &Path) -> Result<Vec<crate::domain::PlanId>> {
    if !store_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(store_dir)
        .with_context(|| format!("Failed to read plan store directory: {}", store_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name.strip_prefix("plan-").and_then(|s| s.strip_suffix(".json")) {
            if let Ok(uuid) = id.parse() {
                ids.push(uuid);
            }
        }
    }
    ids.sort();
    Ok(ids)
}

pub fn delete(store_dir: &Path, plan_id: crate::domain::PlanId) -> Result<()> {
    let path = snapshot_path(store_dir, plan_id);
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to delete plan snapshot: {}", path.display()))?;
    }
    let lock_path = path.with_extension("json.lock");
    let _ = std::fs::remove_file(lock_path);
    Ok(())
}
