//! Repository-level operations used by retry (`clearWorktree`) and RI.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use super::GitManager;

impl GitManager {
    /// Resolve any ref/commitish to a concrete SHA.
    pub fn resolve_ref(&self, dir: &Path, commitish: &str) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", commitish])
            .current_dir(dir)
            .output()
            .context("Failed to run git rev-parse")?;
        if !output.status.success() {
            bail!(
                "could not resolve '{}': {}",
                commitish,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Hard-reset a worktree to a commitish, discarding all local changes.
    pub fn reset_hard(&self, worktree: &Path, commitish: &str) -> Result<()> {
        let output = Command::new("git")
            .args(["reset", "--hard", commitish])
            .current_dir(worktree)
            .output()
            .context("Failed to run git reset --hard")?;
        if !output.status.success() {
            bail!(
                "git reset --hard failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Remove untracked files and directories from a worktree.
    pub fn clean(&self, worktree: &Path) -> Result<()> {
        let output = Command::new("git")
            .args(["clean", "-fd"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git clean")?;
        if !output.status.success() {
            bail!(
                "git clean failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Fetch from the configured remote, if one exists. A repo with no
    /// remote is not an error (most test/local repos have none).
    pub fn fetch(&self) -> Result<()> {
        let remotes = Command::new("git")
            .args(["remote"])
            .current_dir(self.root())
            .output()
            .context("Failed to list remotes")?;
        if String::from_utf8_lossy(&remotes.stdout).trim().is_empty() {
            return Ok(());
        }

        let output = Command::new("git")
            .args(["fetch", "--all"])
            .current_dir(self.root())
            .output()
            .context("Failed to run git fetch")?;
        if !output.status.success() {
            tracing::warn!(
                "git fetch failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Update a branch ref to point at `new_commit`, retrying on transient
    /// `index.lock` contention up to 3 times with 1-3s backoff (spec.md §5).
    pub fn update_ref_with_retry(&self, branch: &str, new_commit: &str) -> Result<()> {
        let refname = format!("refs/heads/{}", branch);
        let mut last_err = String::new();

        for attempt in 0..3u32 {
            let output = Command::new("git")
                .args(["update-ref", &refname, new_commit])
                .current_dir(self.root())
                .output()
                .context("Failed to run git update-ref")?;

            if output.status.success() {
                return Ok(());
            }

            last_err = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !last_err.contains("index.lock") && !last_err.contains("Unable to create") {
                bail!("git update-ref failed: {}", last_err);
            }
            thread::sleep(Duration::from_secs(1 + attempt as u64));
        }

        bail!(
            "git update-ref for '{}' failed after retries: {}",
            branch,
            last_err
        );
    }
}
