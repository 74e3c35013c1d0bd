//! Generic agent runner trait: the abstract coding-agent facade the
//! executor dispatches `WorkSpec::Agent` phases to (spec.md §6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::NodeId;
use crate::stats::UsageMetrics;

/// Everything the executor knows about an agent invocation.
pub struct AgentRunOptions {
    pub node_id: NodeId,
    pub cwd: PathBuf,
    pub task: String,
    pub instructions: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub share_path: Option<PathBuf>,
    pub timeout: std::time::Duration,
    pub skip_instructions_file: bool,
    pub allowed_folders: Vec<PathBuf>,
    pub allowed_urls: Vec<String>,
    pub config_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Outcome of a single agent invocation.
#[derive(Debug, Default)]
pub struct AgentRunResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub metrics: Option<UsageMetrics>,
    /// Set when the process was terminated by a signal rather than exiting
    /// normally — the engine treats this as eligible for agent-killed
    /// retry (spec.md §4.5.7), distinct from an ordinary non-zero exit.
    pub killed_by_signal: bool,
}

/// Trait for agent adapters. One process-wide implementation talks to the
/// real CLI; tests substitute a fake.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run a single agent turn, streaming output lines to `on_output` as
    /// they arrive and reporting the spawned PID via `on_process` so the
    /// caller can register it with `process_registry` before awaiting
    /// completion.
    async fn run(
        &self,
        options: AgentRunOptions,
        on_output: mpsc::Sender<String>,
        on_process: Box<dyn FnOnce(u32) + Send>,
    ) -> Result<AgentRunResult>;

    /// Stable identifier for this agent (used in `AttemptRecord::work_used`
    /// logging and `process_registry::RunningProcess::agent_id`).
    fn id(&self) -> &str;

    /// Whether the backing CLI binary is available right now.
    fn is_available(&self) -> bool;
}

/// Build the instructions file content an agent reads on startup, joining
/// the job's free-text instructions with the allowed-folders/urls the
/// sandboxing CLI flags encode, for runners that support
/// `skip_instructions_file == false`.
pub fn render_instructions_file(options: &AgentRunOptions) -> Option<String> {
    if options.skip_instructions_file {
        return None;
    }
    let instructions = options.instructions.as_deref()?;
    let mut content = String::new();
    content.push_str(instructions);
    if !options.allowed_urls.is_empty() {
        content.push_str("\n\nAllowed URLs:\n");
        for url in &options.allowed_urls {
            content.push_str("- ");
            content.push_str(url);
            content.push('\n');
        }
    }
    Some(content)
}

fn instructions_file_path(cwd: &Path) -> PathBuf {
    cwd.join(".railyard-agent-instructions.md")
}

pub fn write_instructions_file(options: &AgentRunOptions) -> Result<Option<PathBuf>> {
    let Some(content) = render_instructions_file(options) else {
        return Ok(None);
    };
    let path = instructions_file_path(&options.cwd);
    std::fs::write(&path, content)?;
    Ok(Some(path))
}
