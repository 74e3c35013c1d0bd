//! The real `AgentRunner`: shells out to the `copilot` CLI.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::cli_probe::{build_copilot_command, probe_copilot_cli_available};
use super::runner::{AgentRunOptions, AgentRunResult, AgentRunner, write_instructions_file};
use crate::stats::parse_usage_summary;

pub struct CopilotRunner;

impl CopilotRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CopilotRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for CopilotRunner {
    async fn run(
        &self,
        options: AgentRunOptions,
        on_output: mpsc::Sender<String>,
        on_process: Box<dyn FnOnce(u32) + Send>,
    ) -> Result<AgentRunResult> {
        write_instructions_file(&options)?;

        let command = build_copilot_command(
            &options.task,
            &options.allowed_folders,
            options.model.as_deref(),
            options.log_dir.as_deref(),
            options.share_path.as_deref(),
            options.session_id.as_deref(),
        );

        let mut cmd = Command::new(command.program);
        cmd.args(&command.args)
            .current_dir(&options.cwd)
            .envs(&options.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(config_dir) = &options.config_dir {
            cmd.env("COPILOT_CONFIG_DIR", config_dir);
        }

        let mut child = cmd.spawn().context("Failed to spawn copilot CLI")?;

        if let Some(pid) = child.id() {
            on_process(pid);
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let mut combined_output = String::new();
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let timeout_result = tokio::time::timeout(options.timeout, async {
            loop {
                tokio::select! {
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                combined_output.push_str(&line);
                                combined_output.push('\n');
                                let _ = on_output.send(line).await;
                            }
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                    line = stderr_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                combined_output.push_str(&line);
                                combined_output.push('\n');
                                let _ = on_output.send(line).await;
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                }
            }
            child.wait().await
        })
        .await;

        let status = match timeout_result {
            Ok(status) => status.context("Failed to wait on copilot CLI")?,
            Err(_) => {
                let _ = child.start_kill();
                return Ok(AgentRunResult {
                    success: false,
                    session_id: options.session_id,
                    exit_code: None,
                    error: Some(format!(
                        "agent call exceeded timeout of {:?}",
                        options.timeout
                    )),
                    metrics: None,
                    killed_by_signal: false,
                });
            }
        };

        let metrics = parse_usage_summary(&combined_output);

        #[cfg(unix)]
        let killed_by_signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().is_some()
        };
        #[cfg(not(unix))]
        let killed_by_signal = false;

        Ok(AgentRunResult {
            success: status.success(),
            session_id: options.session_id,
            exit_code: status.code(),
            error: if status.success() {
                None
            } else {
                Some(format!("copilot CLI exited with status {:?}", status))
            },
            metrics: Some(metrics),
            killed_by_signal,
        })
    }

    fn id(&self) -> &str {
        "copilot"
    }

    fn is_available(&self) -> bool {
        probe_copilot_cli_available()
    }
}
