//! Reverse-integration merge and plain commit operations for GitManager.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;

use super::types::CommitMessage;
use super::GitManager;

impl GitManager {
    /// Merge a single resolved commit into `target_branch` in the main
    /// repository (never a worktree — RI always lands on the shared repo,
    /// spec.md §4.4 step 6). The merge itself happens against the target
    /// branch's tip in a detached `HEAD`, so moving the branch pointer is
    /// one explicit `update-ref` call (retried on transient `index.lock`
    /// contention, spec.md §5) rather than an implicit side effect of
    /// `git checkout <branch>`. Restores whatever branch was checked out
    /// before the merge, whether it succeeds or fails.
    ///
    /// Callers must hold the process-wide RI mutex (`engine::ri_lock`)
    /// around this call; it does not serialize itself.
    pub fn merge_commit_into_branch(&self, target_branch: &str, commit_sha: &str) -> Result<()> {
        if self.has_tracked_uncommitted_changes()? {
            bail!(
                "Cannot reverse-integrate: repository has uncommitted changes. \
                 Please commit or stash them first."
            );
        }

        let current_branch = self.current_branch()?;
        let should_restore = current_branch != "HEAD";
        let target_tip = self.resolve_ref(self.root(), target_branch)?;

        let checkout_output = Command::new("git")
            .args(["checkout", "--detach", &target_tip])
            .current_dir(self.root())
            .output()
            .context("Failed to checkout target branch tip")?;

        if !checkout_output.status.success() {
            bail!(
                "Failed to checkout target branch '{}' tip: {}",
                target_branch,
                String::from_utf8_lossy(&checkout_output.stderr)
            );
        }

        let merge_output = Command::new("git")
            .args(["merge", "--no-edit", commit_sha])
            .current_dir(self.root())
            .output()
            .context("Failed to merge commit")?;

        if !merge_output.status.success() {
            let stderr = String::from_utf8_lossy(&merge_output.stderr)
                .trim()
                .to_string();

            let aborted = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(self.root())
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);

            if should_restore {
                let _ = Command::new("git")
                    .args(["checkout", &current_branch])
                    .current_dir(self.root())
                    .output();
            }

            if aborted {
                bail!("git merge failed (merge was aborted): {}", stderr);
            }

            bail!(
                "git merge failed (could not abort merge; try `git merge --abort`): {}",
                stderr
            );
        }

        let merged_sha = self.head_sha()?;

        if let Err(e) = self.update_ref_with_retry(target_branch, &merged_sha) {
            // The merge commit exists regardless; only the branch pointer
            // failed to move. Per spec.md §7 item 6, swallow this — the RI
            // is still considered successful — and tell the user how to
            // recover manually.
            tracing::warn!(
                "Failed to move '{}' to {} after RI merge: {}. \
                 The merge commit exists; fast-forward '{}' manually if needed.",
                target_branch,
                merged_sha,
                e,
                target_branch
            );
        }

        if should_restore {
            let checkout_output = Command::new("git")
                .args(["checkout", &current_branch])
                .current_dir(self.root())
                .output()
                .context("Failed to restore original branch after merge")?;

            if !checkout_output.status.success() {
                tracing::warn!(
                    "Failed to restore branch '{}' after RI merge: {}. \
                     The merge commit exists on '{}'; fast-forward manually if needed.",
                    current_branch,
                    String::from_utf8_lossy(&checkout_output.stderr),
                    target_branch
                );
            }
        }

        Ok(())
    }

    /// Commit current changes in the repository root.
    ///
    /// Returns `true` if a commit was created.
    pub fn commit_root_changes(&self, commit_message: &CommitMessage) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(self.root())
            .output()
            .context("Failed to check repo status")?;

        if output.stdout.is_empty() {
            return Ok(false);
        }

        self.commit_all_in_dir(self.root(), commit_message)
    }

    pub(super) fn commit_all_in_dir(&self, dir: &Path, commit_message: &CommitMessage) -> Result<bool> {
        let add_output = Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .context("Failed to stage changes")?;

        if !add_output.status.success() {
            bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&add_output.stderr).trim()
            );
        }

        let mut commit_cmd = Command::new("git");
        commit_cmd
            .arg("commit")
            .arg("-m")
            .arg(&commit_message.subject);
        if let Some(body) = commit_message
            .body
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            commit_cmd.arg("-m").arg(body);
        }

        let commit_output = commit_cmd
            .current_dir(dir)
            .output()
            .context("Failed to commit changes")?;

        if commit_output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&commit_output.stderr);
        if stderr.contains("nothing to commit") {
            tracing::debug!("git commit reported nothing to commit: {}", stderr);
            return Ok(false);
        }

        bail!("git commit failed: {}", stderr.trim());
    }

    /// Commit staged + unstaged changes in a node's worktree during the
    /// `commit` phase. Returns the new commit SHA, or `None` if there was
    /// nothing to commit.
    pub fn commit_worktree_changes(
        &self,
        worktree: &Path,
        commit_message: &CommitMessage,
    ) -> Result<Option<String>> {
        let status_output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(worktree)
            .output()
            .context("Failed to check worktree status")?;

        if status_output.stdout.is_empty() {
            return Ok(None);
        }

        if !self.commit_all_in_dir(worktree, commit_message)? {
            return Ok(None);
        }

        let sha = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(worktree)
            .output()
            .context("Failed to read new commit sha")?;
        Ok(Some(String::from_utf8_lossy(&sha.stdout).trim().to_string()))
    }
}
