//! Git operations and worktree management.
//!
//! `GitOps` is the facade the engine and executor consume (spec.md §6);
//! `GitManager` is its only implementation, shelling out to the `git`
//! binary the same way the teacher's manager does.

mod manager;

pub use manager::{CommitMessage, find_git_root};
pub use manager::{DiffReport, DiffSettings, FileDiff, FileStatus};
pub use manager::{GitManager, WorktreeInfo};

use std::path::Path;

use anyhow::Result;

use crate::domain::NodeId;

/// Operations the job engine needs from Git, abstracted so the engine can
/// be exercised against a fake in unit tests without a real repository.
pub trait GitOps: Send + Sync {
    fn root(&self) -> &Path;
    fn default_worktree_root(&self) -> std::path::PathBuf;
    fn head_sha(&self) -> Result<String>;
    fn current_branch(&self) -> Result<String>;
    fn resolve_ref(&self, dir: &Path, commitish: &str) -> Result<String>;

    fn create_or_reuse_detached(
        &self,
        worktree_root: &Path,
        node_id: NodeId,
        base_commitish: &str,
    ) -> Result<WorktreeInfo>;
    fn remove_worktree_safe(&self, worktree_path: &Path, force: bool) -> Result<()>;
    fn merge_commit_into_worktree(&self, worktree: &Path, commit: &str) -> Result<()>;

    fn commit_worktree_changes(
        &self,
        worktree: &Path,
        commit_message: &CommitMessage,
    ) -> Result<Option<String>>;

    fn merge_commit_into_branch(&self, target_branch: &str, commit_sha: &str) -> Result<()>;
    fn update_ref_with_retry(&self, branch: &str, new_commit: &str) -> Result<()>;

    fn reset_hard(&self, worktree: &Path, commitish: &str) -> Result<()>;
    fn clean(&self, worktree: &Path) -> Result<()>;
    fn fetch(&self) -> Result<()>;

    fn changed_files(&self, worktree: &Path) -> Result<Vec<std::path::PathBuf>>;

    fn diff_report(&self, worktree: &Path, base_branch: Option<&str>, settings: &DiffSettings) -> Result<DiffReport>;
}

impl GitOps for GitManager {
    fn root(&self) -> &Path {
        GitManager::root(self)
    }

    fn default_worktree_root(&self) -> std::path::PathBuf {
        GitManager::default_worktree_root(self)
    }

    fn head_sha(&self) -> Result<String> {
        GitManager::head_sha(self)
    }

    fn current_branch(&self) -> Result<String> {
        GitManager::current_branch(self)
    }

    fn resolve_ref(&self, dir: &Path, commitish: &str) -> Result<String> {
        GitManager::resolve_ref(self, dir, commitish)
    }

    fn create_or_reuse_detached(
        &self,
        worktree_root: &Path,
        node_id: NodeId,
        base_commitish: &str,
    ) -> Result<WorktreeInfo> {
        GitManager::create_or_reuse_detached(self, worktree_root, node_id, base_commitish)
    }

    fn remove_worktree_safe(&self, worktree_path: &Path, force: bool) -> Result<()> {
        GitManager::remove_worktree_safe(self, worktree_path, force)
    }

    fn merge_commit_into_worktree(&self, worktree: &Path, commit: &str) -> Result<()> {
        GitManager::merge_commit_into_worktree(self, worktree, commit)
    }

    fn commit_worktree_changes(
        &self,
        worktree: &Path,
        commit_message: &CommitMessage,
    ) -> Result<Option<String>> {
        GitManager::commit_worktree_changes(self, worktree, commit_message)
    }

    fn merge_commit_into_branch(&self, target_branch: &str, commit_sha: &str) -> Result<()> {
        GitManager::merge_commit_into_branch(self, target_branch, commit_sha)
    }

    fn update_ref_with_retry(&self, branch: &str, new_commit: &str) -> Result<()> {
        GitManager::update_ref_with_retry(self, branch, new_commit)
    }

    fn reset_hard(&self, worktree: &Path, commitish: &str) -> Result<()> {
        GitManager::reset_hard(self, worktree, commitish)
    }

    fn clean(&self, worktree: &Path) -> Result<()> {
        GitManager::clean(self, worktree)
    }

    fn fetch(&self) -> Result<()> {
        GitManager::fetch(self)
    }

    fn changed_files(&self, worktree: &Path) -> Result<Vec<std::path::PathBuf>> {
        GitManager::changed_files(self, worktree)
    }

    fn diff_report(&self, worktree: &Path, base_branch: Option<&str>, settings: &DiffSettings) -> Result<DiffReport> {
        GitManager::diff_report(self, worktree, base_branch, settings)
    }
}
