//! Engine configuration: `<repoPath>/.railyard/config.toml`, loaded with
//! the teacher's atomic-write-plus-lock pattern (`config/io.rs`) and
//! falling back to defaults when absent.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Retry policy for ref updates contending with another process's
/// `index.lock` (spec.md §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_backoff_secs: 1,
            max_backoff_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_max_parallel: usize,
    pub global_max_parallel: Option<usize>,
    pub worktree_root: Option<PathBuf>,
    pub clean_up_successful_work: bool,
    pub ri_lock_retry: RetryConfig,
    pub agent_timeout_secs: u64,
    pub cli_probe_timeout_secs: u64,
    pub cli_probe_negative_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_parallel: 4,
            global_max_parallel: None,
            worktree_root: None,
            clean_up_successful_work: true,
            ri_lock_retry: RetryConfig::default(),
            agent_timeout_secs: 300,
            cli_probe_timeout_secs: 5,
            cli_probe_negative_ttl_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn config_dir(repo_path: &Path) -> PathBuf {
        repo_path.join(".railyard")
    }

    pub fn config_path(repo_path: &Path) -> PathBuf {
        Self::config_dir(repo_path).join("config.toml")
    }

    /// Load `<repoPath>/.railyard/config.toml`, falling back to defaults
    /// (without writing anything) when no file exists yet.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let path = Self::config_path(repo_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save with atomic write and file locking: temp file + fsync +
    /// rename, guarded by an exclusive lock on a sidecar `.lock` file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let lock_path = path.with_extension("toml.lock");
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .with_context(|| "Failed to acquire config lock")?;

        let temp_path = path.with_extension("toml.tmp");
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .context("Failed to write config content")?;
        temp_file.sync_all().context("Failed to sync config file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.default_max_parallel, 4);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = EngineConfig::config_path(dir.path());
        let mut config = EngineConfig::default();
        config.default_max_parallel = 8;
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.default_max_parallel, 8);
    }
}
