//! Worktree operations for GitManager
//!
//! Nodes use detached-HEAD worktrees in a flat layout (`<worktree_root>/<nodeId[:8]>`,
//! spec.md §4.5.3), unlike the teacher's named-branch-per-job layout.

use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use super::{types::WorktreeInfo, GitManager};
use crate::domain::NodeId;

fn worktree_dir_name(node_id: NodeId) -> String {
    node_id.simple().to_string()[..8].to_string()
}

impl GitManager {
    /// Create a worktree for a node in detached HEAD mode at
    /// `<worktree_root>/<nodeId[:8]>`, or reuse it if it already exists
    /// (a retry against the same node after a crash).
    pub fn create_or_reuse_detached(
        &self,
        worktree_root: &Path,
        node_id: NodeId,
        base_commitish: &str,
    ) -> Result<WorktreeInfo> {
        if !self.has_commits() {
            bail!(
                "Cannot create worktree: repository has no commits. \
                Please make an initial commit first."
            );
        }

        #[cfg(unix)]
        {
            if unsafe { libc::geteuid() } == 0 {
                bail!(
                    "Cannot create worktree: running as root. \
                    This would create files owned by root that cannot be modified later."
                );
            }
        }

        std::fs::create_dir_all(worktree_root)
            .with_context(|| format!("Failed to create worktree root {:?}", worktree_root))?;

        let dir_name = worktree_dir_name(node_id);
        let worktree_path = worktree_root.join(&dir_name);

        if worktree_path.exists() {
            let head = Command::new("git")
                .args(["rev-parse", "HEAD"])
                .current_dir(&worktree_path)
                .output()
                .context("Failed to read reused worktree's HEAD")?;
            if !head.status.success() {
                bail!(
                    "Existing worktree directory {:?} is not a usable git worktree: {}",
                    worktree_path,
                    String::from_utf8_lossy(&head.stderr)
                );
            }
            let base_commit = String::from_utf8_lossy(&head.stdout).trim().to_string();
            return Ok(WorktreeInfo {
                path: worktree_path,
                base_commit,
                reused: true,
            });
        }

        let worktree_path_str = worktree_path
            .to_str()
            .ok_or_else(|| anyhow!("Worktree path contains invalid UTF-8"))?;

        let mut last_err = String::new();
        for attempt in 0..3 {
            let output = Command::new("git")
                .args(["worktree", "add", "--detach", worktree_path_str, base_commitish])
                .current_dir(self.root())
                .output()
                .context("Failed to create worktree")?;

            if output.status.success() {
                let resolved = self.head_sha_in(&worktree_path)?;
                return Ok(WorktreeInfo {
                    path: worktree_path,
                    base_commit: resolved,
                    reused: false,
                });
            }

            last_err = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !last_err.contains("index.lock") && !last_err.contains("already exists") {
                bail!("Failed to create worktree: {}", last_err);
            }
            thread::sleep(Duration::from_millis(500 * (attempt + 1)));
        }

        bail!(
            "Failed to create worktree for node {} after retries: {}",
            node_id,
            last_err
        );
    }

    fn head_sha_in(&self, dir: &Path) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .context("Failed to run git rev-parse")?;
        if !output.status.success() {
            bail!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Remove a worktree, tolerating its prior removal. Never fails the
    /// caller: logs and returns `Ok(())` on git-level failure, since the
    /// work it guards has already succeeded by the time GC runs.
    pub fn remove_worktree_safe(&self, worktree_path: &Path, force: bool) -> Result<()> {
        if !worktree_path.exists() {
            return Ok(());
        }

        let worktree_path_str = worktree_path
            .to_str()
            .ok_or_else(|| anyhow!("Worktree path contains invalid UTF-8"))?;

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(worktree_path_str);

        let output = Command::new("git")
            .args(&args)
            .current_dir(self.root())
            .output()
            .context("Failed to remove worktree")?;

        if !output.status.success() {
            tracing::warn!(
                worktree = %worktree_path.display(),
                "git worktree remove failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }

    /// Get the list of changed files in a worktree (including modified and new files)
    pub fn changed_files(&self, worktree: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        let output = Command::new("git")
            .args(["diff", "--name-only", "HEAD"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff")?;

        if !output.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        files.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.is_empty())
                .map(PathBuf::from),
        );

        let output = Command::new("git")
            .args(["ls-files", "--others", "--exclude-standard"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git ls-files")?;

        if output.status.success() {
            files.extend(
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(PathBuf::from),
            );
        }

        Ok(files)
    }

    /// Get untracked files in a worktree/repo.
    pub fn untracked_files(&self, worktree: &Path) -> Result<Vec<PathBuf>> {
        let output = Command::new("git")
            .args(["ls-files", "--others", "--exclude-standard"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git ls-files")?;

        if !output.status.success() {
            bail!(
                "git ls-files failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Merge a single commit into the worktree's current HEAD (used by the
    /// executor's merge-fi phase to fold in each dependency commit in order).
    pub fn merge_commit_into_worktree(&self, worktree: &Path, commit: &str) -> Result<()> {
        let output = Command::new("git")
            .args(["merge", "--no-edit", commit])
            .current_dir(worktree)
            .output()
            .context("Failed to run git merge")?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let _ = Command::new("git")
            .args(["merge", "--abort"])
            .current_dir(worktree)
            .output();

        bail!("merge-fi failed merging {}: {}", commit, stderr);
    }
}
