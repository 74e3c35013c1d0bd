//! Phase executor: runs a single job attempt's six-phase pipeline
//! (spec.md §4.4) against an injected [`GitOps`] and [`AgentRunner`].
//!
//! Reverse integration is split out into [`PhaseExecutor::run_merge_ri`]
//! so the engine can hold the process-wide RI mutex only around that one
//! git operation, rather than for the whole attempt.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::agent::{AgentRunOptions, AgentRunner};
use crate::domain::{NodeId, PhaseName, StepStatus, WorkSpec};
use crate::error::PhaseFailure;
use crate::git::{CommitMessage, GitOps};
use crate::stats::UsageMetrics;

pub type StepStatusCallback = Arc<dyn Fn(PhaseName, StepStatus) + Send + Sync>;
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ProcessCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Everything the executor needs to run (or resume) one attempt.
pub struct ExecutionContext {
    pub node_id: NodeId,
    pub task: String,
    pub worktree_path: PathBuf,
    pub base_commit: String,
    /// FI sources beyond the base commit, in dependency-declaration order.
    pub dependency_commits: Vec<String>,
    pub attempt_number: u32,
    pub copilot_session_id: Option<String>,
    pub resume_from_phase: Option<PhaseName>,
    pub previous_step_statuses: BTreeMap<PhaseName, StepStatus>,
    pub expects_no_changes: bool,
    pub prechecks: Option<WorkSpec>,
    pub work: Option<WorkSpec>,
    pub postchecks: Option<WorkSpec>,
    pub agent_timeout: Duration,
    pub agent_log_dir: Option<PathBuf>,
    pub agent_config_dir: Option<PathBuf>,
}

/// Callbacks the executor drives during a run; the engine wires these to
/// mutate `NodeExecutionState` and forward to the event bus. Cloneable
/// trait objects rather than borrows, since agent runs need to move a
/// `'static` process callback into the underlying `AgentRunner`.
#[derive(Clone)]
pub struct PhaseCallbacks {
    pub on_step_status: StepStatusCallback,
    pub on_output: OutputCallback,
    pub on_process: ProcessCallback,
}

/// Outcome of everything up to (but not including) `merge-ri`.
#[derive(Debug, Default)]
pub struct PhaseOutcome {
    pub success: bool,
    pub completed_commit: Option<String>,
    pub copilot_session_id: Option<String>,
    pub step_statuses: BTreeMap<PhaseName, StepStatus>,
    pub phase_metrics: BTreeMap<PhaseName, UsageMetrics>,
    pub work_summary: Option<UsageMetrics>,
    pub failed_phase: Option<PhaseName>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub signal_killed: bool,
}

#[derive(Default)]
struct RunOutcome {
    session_id: Option<String>,
    metrics: Option<UsageMetrics>,
    commit_sha: Option<String>,
}

pub struct PhaseExecutor<'a> {
    git: &'a dyn GitOps,
    agent: &'a dyn AgentRunner,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(git: &'a dyn GitOps, agent: &'a dyn AgentRunner) -> Self {
        Self { git, agent }
    }

    /// Runs merge-fi through postchecks, honoring `resume_from_phase`.
    /// Never runs merge-ri — call [`Self::run_merge_ri`] separately.
    pub async fn run(&self, ctx: &ExecutionContext, callbacks: &PhaseCallbacks) -> PhaseOutcome {
        let mut outcome = PhaseOutcome {
            step_statuses: ctx.previous_step_statuses.clone(),
            ..Default::default()
        };

        let start_index = ctx
            .resume_from_phase
            .map(|p| PhaseName::ORDER.iter().position(|x| *x == p).unwrap_or(0))
            .unwrap_or(0);

        for (index, phase) in PhaseName::ORDER.iter().enumerate() {
            if *phase == PhaseName::MergeRi {
                continue;
            }
            if index < start_index {
                continue;
            }
            if ctx.previous_step_statuses.get(phase) == Some(&StepStatus::Success) {
                outcome.step_statuses.insert(*phase, StepStatus::Success);
                continue;
            }

            (callbacks.on_step_status)(*phase, StepStatus::Running);
            let result = match phase {
                PhaseName::MergeFi => self.run_merge_fi(ctx).await,
                PhaseName::Prechecks => self.run_optional_phase(*phase, ctx, ctx.prechecks.as_ref(), callbacks).await,
                PhaseName::Work => self.run_optional_phase(*phase, ctx, ctx.work.as_ref(), callbacks).await,
                PhaseName::Commit => self.run_commit(ctx).await,
                PhaseName::Postchecks => {
                    self.run_optional_phase(*phase, ctx, ctx.postchecks.as_ref(), callbacks).await
                }
                PhaseName::MergeRi => unreachable!("filtered above"),
            };

            match result {
                Ok(phase_result) => {
                    outcome.step_statuses.insert(*phase, StepStatus::Success);
                    (callbacks.on_step_status)(*phase, StepStatus::Success);
                    if let Some(session_id) = phase_result.session_id {
                        outcome.copilot_session_id = Some(session_id);
                    }
                    if let Some(metrics) = phase_result.metrics {
                        outcome.work_summary.get_or_insert_with(UsageMetrics::default).merge(&metrics);
                        outcome.phase_metrics.insert(*phase, metrics);
                    }
                    if *phase == PhaseName::Commit {
                        outcome.completed_commit = phase_result.commit_sha;
                    }
                }
                Err(failure) => {
                    outcome.step_statuses.insert(*phase, StepStatus::Failed);
                    (callbacks.on_step_status)(*phase, StepStatus::Failed);
                    outcome.success = false;
                    outcome.failed_phase = Some(*phase);
                    outcome.error = Some(failure.message.clone());
                    outcome.exit_code = failure.exit_code;
                    outcome.signal_killed = failure.signal_killed;
                    for remaining in PhaseName::ORDER.iter().skip(index + 1) {
                        if *remaining != PhaseName::MergeRi {
                            outcome.step_statuses.insert(*remaining, StepStatus::Skipped);
                        }
                    }
                    return outcome;
                }
            }
        }

        outcome.success = true;
        if outcome.completed_commit.is_none() && ctx.expects_no_changes {
            outcome.completed_commit = Some(ctx.base_commit.clone());
        }
        outcome
    }

    /// Merges `completed_commit` into `target_branch`. Caller MUST hold
    /// the process-wide RI mutex for the duration of this call.
    pub fn run_merge_ri(&self, target_branch: &str, completed_commit: &str) -> Result<(), PhaseFailure> {
        self.git
            .merge_commit_into_branch(target_branch, completed_commit)
            .map_err(|e| PhaseFailure::new(PhaseName::MergeRi, e.to_string()))
    }

    async fn run_merge_fi(&self, ctx: &ExecutionContext) -> Result<RunOutcome, PhaseFailure> {
        for commit in &ctx.dependency_commits {
            self.git
                .merge_commit_into_worktree(&ctx.worktree_path, commit)
                .map_err(|e| PhaseFailure::new(PhaseName::MergeFi, e.to_string()))?;
        }
        Ok(RunOutcome::default())
    }

    async fn run_commit(&self, ctx: &ExecutionContext) -> Result<RunOutcome, PhaseFailure> {
        let changed = self
            .git
            .changed_files(&ctx.worktree_path)
            .map_err(|e| PhaseFailure::new(PhaseName::Commit, e.to_string()))?;

        if changed.is_empty() {
            if ctx.expects_no_changes {
                return Ok(RunOutcome::default());
            }
            return Err(PhaseFailure::new(
                PhaseName::Commit,
                "no changes were made, and expectsNoChanges is false".to_string(),
            ));
        }

        let message = CommitMessage::for_node(&ctx.task, ctx.node_id);
        let sha = self
            .git
            .commit_worktree_changes(&ctx.worktree_path, &message)
            .map_err(|e| PhaseFailure::new(PhaseName::Commit, e.to_string()))?;

        Ok(RunOutcome {
            commit_sha: sha,
            ..Default::default()
        })
    }

    async fn run_optional_phase(
        &self,
        phase: PhaseName,
        ctx: &ExecutionContext,
        spec: Option<&WorkSpec>,
        callbacks: &PhaseCallbacks,
    ) -> Result<RunOutcome, PhaseFailure> {
        let Some(spec) = spec else {
            return Ok(RunOutcome::default());
        };
        let normalized = spec.normalized();

        match normalized.as_ref() {
            WorkSpec::Shell { command, shell, env, .. } => {
                self.run_shell(phase, ctx, command, shell.as_deref(), env, callbacks).await
            }
            WorkSpec::Process { executable, args, env, .. } => {
                self.run_process(phase, ctx, executable, args, env, callbacks).await
            }
            WorkSpec::Agent {
                instructions,
                model,
                allowed_folders,
                allowed_urls,
                resume_session,
                ..
            } => {
                self.run_agent(
                    phase,
                    ctx,
                    instructions,
                    model.as_deref(),
                    allowed_folders,
                    allowed_urls,
                    *resume_session,
                    callbacks,
                )
                .await
            }
            WorkSpec::Plain(_) => unreachable!("normalized() never returns Plain"),
        }
    }

    async fn run_shell(
        &self,
        phase: PhaseName,
        ctx: &ExecutionContext,
        command: &str,
        shell: Option<&str>,
        env: &std::collections::HashMap<String, String>,
        callbacks: &PhaseCallbacks,
    ) -> Result<RunOutcome, PhaseFailure> {
        let shell_bin = shell.unwrap_or(if cfg!(windows) { "cmd" } else { "sh" });
        let shell_flag = if cfg!(windows) { "/C" } else { "-c" };

        let mut cmd = tokio::process::Command::new(shell_bin);
        cmd.arg(shell_flag)
            .arg(command)
            .current_dir(&ctx.worktree_path)
            .envs(env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        self.spawn_and_stream(phase, cmd, callbacks).await
    }

    async fn run_process(
        &self,
        phase: PhaseName,
        ctx: &ExecutionContext,
        executable: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        callbacks: &PhaseCallbacks,
    ) -> Result<RunOutcome, PhaseFailure> {
        let mut cmd = tokio::process::Command::new(executable);
        cmd.args(args)
            .current_dir(&ctx.worktree_path)
            .envs(env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        self.spawn_and_stream(phase, cmd, callbacks).await
    }

    async fn spawn_and_stream(
        &self,
        phase: PhaseName,
        mut cmd: tokio::process::Command,
        callbacks: &PhaseCallbacks,
    ) -> Result<RunOutcome, PhaseFailure> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = cmd
            .spawn()
            .map_err(|e| PhaseFailure::new(phase, format!("failed to spawn: {e}")))?;

        if let Some(pid) = child.id() {
            (callbacks.on_process)(pid);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                (callbacks.on_output)(&line);
            }
        }
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                (callbacks.on_output)(&line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PhaseFailure::new(phase, format!("failed to wait: {e}")))?;

        if status.success() {
            Ok(RunOutcome::default())
        } else {
            Err(PhaseFailure::new(phase, format!("exited with status {status}"))
                .with_exit_code(status.code().unwrap_or(-1)))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_agent(
        &self,
        phase: PhaseName,
        ctx: &ExecutionContext,
        instructions: &str,
        model: Option<&str>,
        allowed_folders: &[PathBuf],
        allowed_urls: &[String],
        resume_session: bool,
        callbacks: &PhaseCallbacks,
    ) -> Result<RunOutcome, PhaseFailure> {
        let (tx, mut rx) = mpsc::channel::<String>(64);

        let options = AgentRunOptions {
            node_id: ctx.node_id,
            cwd: ctx.worktree_path.clone(),
            task: ctx.task.clone(),
            instructions: Some(instructions.to_string()),
            session_id: if resume_session {
                ctx.copilot_session_id.clone()
            } else {
                None
            },
            model: model.map(|s| s.to_string()),
            log_dir: ctx.agent_log_dir.clone(),
            share_path: None,
            timeout: ctx.agent_timeout,
            skip_instructions_file: false,
            allowed_folders: allowed_folders.to_vec(),
            allowed_urls: allowed_urls.to_vec(),
            config_dir: ctx.agent_config_dir.clone(),
            env: std::collections::HashMap::new(),
        };

        let on_process = {
            let cb = callbacks.on_process.clone();
            let boxed: Box<dyn FnOnce(u32) + Send> = Box::new(move |pid| cb(pid));
            boxed
        };

        let forward = async {
            while let Some(line) = rx.recv().await {
                (callbacks.on_output)(&line);
            }
        };

        let (result, _) = tokio::join!(self.agent.run(options, tx, on_process), forward);
        let result = result.map_err(|e| PhaseFailure::new(phase, e.to_string()))?;

        if result.killed_by_signal {
            return Err(
                PhaseFailure::new(phase, "agent process was terminated by a signal".to_string())
                    .with_signal_killed(),
            );
        }

        if !result.success {
            return Err(PhaseFailure::new(
                phase,
                result.error.unwrap_or_else(|| "agent run failed".to_string()),
            )
            .with_exit_code(result.exit_code.unwrap_or(-1)));
        }

        Ok(RunOutcome {
            session_id: result.session_id,
            metrics: result.metrics,
            commit_sha: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command as StdCommand;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::agent::AgentRunResult;
    use crate::git::GitManager;

    fn git(dir: &std::path::Path, args: &[&str]) {
        let status = StdCommand::new("git").args(args).current_dir(dir).status().expect("run git");
        assert!(status.success(), "git {args:?} failed in {dir:?}");
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        git(dir.path(), &["init"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "initial"]);
        dir
    }

    fn noop_callbacks() -> PhaseCallbacks {
        PhaseCallbacks {
            on_step_status: Arc::new(|_, _| {}),
            on_output: Arc::new(|_| {}),
            on_process: Arc::new(|_| {}),
        }
    }

    fn recording_callbacks() -> (PhaseCallbacks, Arc<Mutex<Vec<(PhaseName, StepStatus)>>>) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let recorded_clone = recorded.clone();
        let callbacks = PhaseCallbacks {
            on_step_status: Arc::new(move |phase, status| {
                recorded_clone.lock().unwrap().push((phase, status));
            }),
            on_output: Arc::new(|_| {}),
            on_process: Arc::new(|_| {}),
        };
        (callbacks, recorded)
    }

    fn base_context(worktree_path: PathBuf, base_commit: String) -> ExecutionContext {
        ExecutionContext {
            node_id: Uuid::new_v4(),
            task: "do something".to_string(),
            worktree_path,
            base_commit,
            dependency_commits: vec![],
            attempt_number: 1,
            copilot_session_id: None,
            resume_from_phase: None,
            previous_step_statuses: BTreeMap::new(),
            expects_no_changes: false,
            prechecks: None,
            work: None,
            postchecks: None,
            agent_timeout: Duration::from_secs(30),
            agent_log_dir: None,
            agent_config_dir: None,
        }
    }

    struct WritingAgent;

    #[async_trait]
    impl AgentRunner for WritingAgent {
        async fn run(
            &self,
            options: AgentRunOptions,
            on_output: mpsc::Sender<String>,
            on_process: Box<dyn FnOnce(u32) + Send>,
        ) -> anyhow::Result<AgentRunResult> {
            on_process(std::process::id());
            let _ = on_output.send("agent output".to_string()).await;
            std::fs::write(options.cwd.join("agent_output.txt"), "from agent\n")?;
            Ok(AgentRunResult {
                success: true,
                session_id: Some("session-xyz".to_string()),
                exit_code: Some(0),
                error: None,
                metrics: None,
                killed_by_signal: false,
            })
        }

        fn id(&self) -> &str {
            "writing-agent"
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    struct UnusedAgent;

    #[async_trait]
    impl AgentRunner for UnusedAgent {
        async fn run(
            &self,
            _options: AgentRunOptions,
            _on_output: mpsc::Sender<String>,
            _on_process: Box<dyn FnOnce(u32) + Send>,
        ) -> anyhow::Result<AgentRunResult> {
            panic!("this test's work spec never dispatches to the agent");
        }

        fn id(&self) -> &str {
            "unused"
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn worktree_for(repo: &TempDir) -> (GitManager, PathBuf, String) {
        let manager = GitManager::new(repo.path()).expect("git manager");
        let base = manager.head_sha().expect("head sha");
        let info = manager
            .create_or_reuse_detached(&repo.path().join("worktrees"), Uuid::new_v4(), &base)
            .expect("create worktree");
        (manager, info.path, base)
    }

    #[tokio::test]
    async fn run_executes_shell_phases_in_order_and_commits() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = UnusedAgent;
        let executor = PhaseExecutor::new(&manager, &agent);

        let mut ctx = base_context(worktree.clone(), base);
        ctx.prechecks = Some(WorkSpec::Plain("true".to_string()));
        ctx.work = Some(WorkSpec::Plain("echo work > output.txt".to_string()));
        ctx.postchecks = Some(WorkSpec::Plain("test -f output.txt".to_string()));

        let outcome = executor.run(&ctx, &noop_callbacks()).await;

        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.step_statuses[&PhaseName::Prechecks], StepStatus::Success);
        assert_eq!(outcome.step_statuses[&PhaseName::Work], StepStatus::Success);
        assert_eq!(outcome.step_statuses[&PhaseName::Commit], StepStatus::Success);
        assert_eq!(outcome.step_statuses[&PhaseName::Postchecks], StepStatus::Success);
        assert!(outcome.completed_commit.is_some());
        assert!(worktree.join("output.txt").exists());
    }

    #[tokio::test]
    async fn run_stops_at_the_first_failing_phase_and_skips_the_rest() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = UnusedAgent;
        let executor = PhaseExecutor::new(&manager, &agent);

        let mut ctx = base_context(worktree, base);
        ctx.prechecks = Some(WorkSpec::Plain("true".to_string()));
        ctx.work = Some(WorkSpec::Plain("exit 1".to_string()));
        ctx.postchecks = Some(WorkSpec::Plain("true".to_string()));

        let (callbacks, recorded) = recording_callbacks();
        let outcome = executor.run(&ctx, &callbacks).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failed_phase, Some(PhaseName::Work));
        assert_eq!(outcome.step_statuses[&PhaseName::Work], StepStatus::Failed);
        assert_eq!(outcome.step_statuses[&PhaseName::Commit], StepStatus::Skipped);
        assert_eq!(outcome.step_statuses[&PhaseName::Postchecks], StepStatus::Skipped);
        assert!(recorded.lock().unwrap().contains(&(PhaseName::Work, StepStatus::Failed)));
    }

    #[tokio::test]
    async fn resume_from_phase_skips_phases_already_marked_succeeded() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = UnusedAgent;
        let executor = PhaseExecutor::new(&manager, &agent);

        // Simulate resuming after prechecks already succeeded on a prior attempt.
        std::fs::write(worktree.join("precheck_marker.txt"), "from a previous attempt\n").unwrap();
        let mut previous = BTreeMap::new();
        previous.insert(PhaseName::Prechecks, StepStatus::Success);

        let mut ctx = base_context(worktree.clone(), base);
        ctx.resume_from_phase = Some(PhaseName::Work);
        ctx.previous_step_statuses = previous;
        // If prechecks re-ran it would fail and the whole attempt would fail with it.
        ctx.prechecks = Some(WorkSpec::Plain("exit 1".to_string()));
        ctx.work = Some(WorkSpec::Plain("echo resumed > output.txt".to_string()));

        let outcome = executor.run(&ctx, &noop_callbacks()).await;

        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.step_statuses.get(&PhaseName::Prechecks), Some(&StepStatus::Success));
        assert_eq!(outcome.step_statuses[&PhaseName::Work], StepStatus::Success);
        assert!(worktree.join("output.txt").exists());
    }

    #[tokio::test]
    async fn commit_phase_fails_when_nothing_changed_and_changes_were_expected() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = UnusedAgent;
        let executor = PhaseExecutor::new(&manager, &agent);

        let mut ctx = base_context(worktree, base);
        ctx.work = Some(WorkSpec::Plain("true".to_string()));
        ctx.expects_no_changes = false;

        let outcome = executor.run(&ctx, &noop_callbacks()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failed_phase, Some(PhaseName::Commit));
    }

    #[tokio::test]
    async fn commit_phase_succeeds_with_no_changes_when_none_were_expected() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = UnusedAgent;
        let executor = PhaseExecutor::new(&manager, &agent);

        let mut ctx = base_context(worktree, base.clone());
        ctx.work = Some(WorkSpec::Plain("true".to_string()));
        ctx.expects_no_changes = true;

        let outcome = executor.run(&ctx, &noop_callbacks()).await;

        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.completed_commit, Some(base));
    }

    #[tokio::test]
    async fn agent_work_phase_captures_session_id_and_writes_changes() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = WritingAgent;
        let executor = PhaseExecutor::new(&manager, &agent);

        let mut ctx = base_context(worktree.clone(), base);
        ctx.work = Some(WorkSpec::Agent {
            instructions: "write something".to_string(),
            model: None,
            allowed_folders: vec![],
            allowed_urls: vec![],
            resume_session: false,
            on_failure: None,
        });

        let outcome = executor.run(&ctx, &noop_callbacks()).await;

        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.copilot_session_id.as_deref(), Some("session-xyz"));
        assert!(worktree.join("agent_output.txt").exists());
    }

    #[tokio::test]
    async fn run_merge_ri_merges_the_completed_commit_into_the_target_branch() {
        let repo = init_repo();
        let (manager, worktree, base) = worktree_for(&repo);
        let agent = UnusedAgent;
        let executor = PhaseExecutor::new(&manager, &agent);
        let _ = base;

        std::fs::write(worktree.join("ri.txt"), "reverse integrated\n").unwrap();
        let commit = manager
            .commit_worktree_changes(
                &worktree,
                &CommitMessage {
                    subject: "ri work".to_string(),
                    body: None,
                },
            )
            .expect("commit")
            .expect("a commit should exist");

        let target_branch = manager.current_branch().expect("current branch");
        executor.run_merge_ri(&target_branch, &commit).expect("merge-ri should succeed");

        assert!(repo.path().join("ri.txt").exists());
    }
}
