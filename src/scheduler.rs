//! `PlanRunner` (spec.md §4.6): owns every in-memory `PlanInstance`, pumps
//! ready nodes into the job engine, and exposes the plan-level operations
//! (`enqueue/start/pause/resume/cancel/delete`, `retryNode`,
//! `forceFailNode`) the CLI and any embedding host drive.
//!
//! Node attempts within a single plan are serialized behind that plan's
//! own `tokio::sync::Mutex<PlanInstance>` — the engine takes `&mut
//! PlanInstance` for the full duration of an attempt, so two attempts
//! against the same plan can't run with genuinely overlapping mutable
//! access. `maxParallel` and the optional global cap are still enforced at
//! admission time (how many nodes get marked `scheduled` in one pump
//! tick); across different plans, which each hold their own mutex,
//! attempts do run concurrently.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};

use crate::agent::process_registry;
use crate::builder::{build_plan, BuildOptions};
use crate::config::EngineConfig;
use crate::domain::{AttemptTrigger, NodeId, NodeStatus, PhaseName, PlanId, PlanInstance, PlanSpec, WorkSpec};
use crate::engine::JobEngine;
use crate::events::{EngineEvent, EventBus};
use crate::git::GitOps;
use crate::state_machine::{NodeUpdate, PlanStateMachine};
use crate::watcher::{PlanStoreWatcher, WatchEvent};
use crate::{persistence, stats};

/// How many trailing characters of a failed attempt's captured log feed
/// the auto-generated heal prompt `retryNode` writes when the caller
/// doesn't supply a replacement work spec.
const RETRY_LOG_TAIL_CHARS: usize = 2000;

/// Per-node overrides for a manual retry (spec.md §4.6 `retryNode`).
#[derive(Debug, Default, Clone)]
pub struct RetryOptions {
    pub new_work: Option<WorkSpec>,
    pub new_prechecks: Option<WorkSpec>,
    pub new_postchecks: Option<WorkSpec>,
    pub clear_worktree: bool,
    pub resume_session: bool,
}

pub struct PlanRunner {
    plans: AsyncMutex<HashMap<PlanId, Arc<AsyncMutex<PlanInstance>>>>,
    sm: Arc<PlanStateMachine>,
    engine: Arc<JobEngine>,
    git: Arc<dyn GitOps>,
    events: Arc<EventBus>,
    store_dir: PathBuf,
    global_semaphore: Option<Arc<Semaphore>>,
    inflight: std::sync::Mutex<HashMap<PlanId, HashSet<NodeId>>>,
    notify: Notify,
    watcher: Option<PlanStoreWatcher>,
}

impl PlanRunner {
    /// `watch_debounce_ms`: `None` disables the snapshot-directory watcher
    /// (spec.md §4.7); `Some(ms)` starts one debounced by that many
    /// milliseconds.
    pub fn new(
        engine: Arc<JobEngine>,
        git: Arc<dyn GitOps>,
        sm: Arc<PlanStateMachine>,
        events: Arc<EventBus>,
        store_dir: PathBuf,
        config: &EngineConfig,
        watch_debounce_ms: Option<u64>,
    ) -> Arc<Self> {
        let watcher = watch_debounce_ms.and_then(|ms| match PlanStoreWatcher::new(&store_dir, ms) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "failed to start plan store watcher");
                None
            }
        });

        let runner = Arc::new(Self {
            plans: AsyncMutex::new(HashMap::new()),
            sm,
            engine,
            git,
            events,
            store_dir,
            global_semaphore: config.global_max_parallel.map(|n| Arc::new(Semaphore::new(n))),
            inflight: std::sync::Mutex::new(HashMap::new()),
            notify: Notify::new(),
            watcher,
        });
        runner.spawn_pump_loop();
        runner
    }

    /// Loads every snapshot under the store directory that isn't already
    /// held in memory. Call once at process startup to resume plans left
    /// running across a crash or restart.
    pub async fn load_persisted(&self) -> Result<()> {
        let ids = persistence::list_plan_ids(&self.store_dir)?;
        let mut plans = self.plans.lock().await;
        for id in ids {
            if plans.contains_key(&id) {
                continue;
            }
            let plan = persistence::load(&self.store_dir, id)
                .with_context(|| format!("failed to load persisted plan {id}"))?;
            plans.insert(id, Arc::new(AsyncMutex::new(plan)));
        }
        Ok(())
    }

    pub async fn list_plan_ids(&self) -> Vec<PlanId> {
        self.plans.lock().await.keys().copied().collect()
    }

    pub async fn enqueue(&self, spec: PlanSpec, options: BuildOptions) -> Result<PlanId> {
        let plan = build_plan(spec, options).context("plan spec rejected")?;
        let plan_id = plan.id;
        persistence::save(&self.store_dir, &plan)?;
        self.plans.lock().await.insert(plan_id, Arc::new(AsyncMutex::new(plan)));
        self.events.publish(EngineEvent::PlanRegistered { plan_id });
        Ok(plan_id)
    }

    pub async fn start(&self, plan_id: PlanId) -> Result<()> {
        let plan_arc = self.get_plan(plan_id).await?;
        {
            let mut plan = plan_arc.lock().await;
            if plan.started_at.is_none() {
                plan.started_at = Some(Utc::now());
            }
            plan.is_paused = false;
            plan.touch();
            persistence::save(&self.store_dir, &plan)?;
        }
        self.events.publish(EngineEvent::PlanStarted { plan_id });
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pause(&self, plan_id: PlanId) -> Result<()> {
        let plan_arc = self.get_plan(plan_id).await?;
        {
            let mut plan = plan_arc.lock().await;
            plan.is_paused = true;
            plan.touch();
            persistence::save(&self.store_dir, &plan)?;
        }
        self.events.publish(EngineEvent::PlanPaused { plan_id });
        Ok(())
    }

    pub async fn resume(&self, plan_id: PlanId) -> Result<()> {
        let plan_arc = self.get_plan(plan_id).await?;
        {
            let mut plan = plan_arc.lock().await;
            plan.is_paused = false;
            plan.touch();
            persistence::save(&self.store_dir, &plan)?;
        }
        self.events.publish(EngineEvent::PlanResumed { plan_id });
        self.notify.notify_one();
        Ok(())
    }

    pub async fn cancel(&self, plan_id: PlanId) -> Result<()> {
        let plan_arc = self.get_plan(plan_id).await?;
        {
            let mut plan = plan_arc.lock().await;
            self.sm.cancel_all(&mut plan);
            if plan.ended_at.is_none() {
                plan.ended_at = Some(Utc::now());
            }
            persistence::save(&self.store_dir, &plan)?;
        }
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).remove(&plan_id);
        Ok(())
    }

    pub async fn delete(&self, plan_id: PlanId) -> Result<()> {
        self.plans.lock().await.remove(&plan_id);
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).remove(&plan_id);
        persistence::delete(&self.store_dir, plan_id)?;
        self.events.publish(EngineEvent::PlanDeleted { plan_id });
        Ok(())
    }

    /// A clone of the plan's full current state, for status reporting.
    pub async fn snapshot(&self, plan_id: PlanId) -> Result<PlanInstance> {
        let plan_arc = self.get_plan(plan_id).await?;
        Ok(plan_arc.lock().await.clone())
    }

    /// Manual retry (spec.md §4.6 `retryNode`): resets a terminal node back
    /// to `pending`/`ready`, optionally substituting its work/prechecks/
    /// postchecks, optionally clearing the worktree back to its base.
    pub async fn retry_node(&self, plan_id: PlanId, producer_id: &str, options: RetryOptions) -> Result<()> {
        let plan_arc = self.get_plan(plan_id).await?;
        let mut plan = plan_arc.lock().await;

        let node_id = plan
            .node_id_for_producer(producer_id)
            .ok_or_else(|| anyhow!("unknown producer id '{producer_id}'"))?;

        let status = plan
            .node_states
            .get(&node_id)
            .map(|s| s.status)
            .ok_or_else(|| anyhow!("node '{producer_id}' has no execution state"))?;
        if !matches!(status, NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled) {
            bail!("node '{producer_id}' is not retryable from status '{status}'");
        }

        let had_explicit_change = options.new_work.is_some() || options.new_prechecks.is_some() || options.new_postchecks.is_some();

        if options.clear_worktree {
            let already_consumed = plan
                .node_states
                .get(&node_id)
                .map(|s| !s.consumed_by_dependents.is_empty())
                .unwrap_or(false);
            if already_consumed {
                bail!("cannot clear worktree for '{producer_id}': a dependent has already merged its commit from it");
            }

            let worktree_path = plan.node_states.get(&node_id).and_then(|s| s.worktree_path.clone());
            let base_commit = plan.node_states.get(&node_id).and_then(|s| s.base_commit.clone());
            if let (Some(path), Some(base)) = (worktree_path, base_commit) {
                self.git.fetch().context("fetch before clearing worktree")?;
                self.git.reset_hard(&path, &base).context("reset worktree to base commit")?;
                self.git.clean(&path).context("clean worktree")?;
            }

            if let Some(state) = plan.node_states.get_mut(&node_id) {
                state.completed_commit = None;
                state.work_commit = None;
                state.step_statuses.clear();
                state.resume_from_phase = None;
                state.merged_to_target = false;
                if !options.resume_session {
                    state.copilot_session_id = None;
                }
            }
        }

        if !had_explicit_change {
            self.auto_generate_heal_prompt(&mut plan, node_id, options.resume_session);
        }

        if let Some(work) = options.new_work {
            if let Some(node) = plan.nodes.get_mut(&node_id) {
                node.work = Some(work);
            }
        }
        if let Some(prechecks) = options.new_prechecks {
            if let Some(node) = plan.nodes.get_mut(&node_id) {
                node.prechecks = Some(prechecks);
            }
        }
        if let Some(postchecks) = options.new_postchecks {
            if let Some(node) = plan.nodes.get_mut(&node_id) {
                node.postchecks = Some(postchecks);
            }
        }

        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.next_attempt_trigger = Some(AttemptTrigger::Retry);
            state.auto_heal_attempted.clear();
            state.force_failed = false;
        }

        self.sm.reset_node_to_pending(&mut plan, node_id);
        self.events.publish(EngineEvent::NodeRetry { plan_id, node_id });
        persistence::save(&self.store_dir, &plan)?;
        drop(plan);
        self.notify.notify_one();
        Ok(())
    }

    /// Builds a heal-style agent work spec from the last attempt's captured
    /// log tail and installs it in place of whichever phase last failed.
    /// Only called when the caller didn't supply an explicit replacement.
    fn auto_generate_heal_prompt(&self, plan: &mut PlanInstance, node_id: NodeId, resume_session: bool) {
        let Some(phase) = plan.node_states.get(&node_id).and_then(|s| s.last_attempt_phase) else {
            return;
        };
        if !matches!(phase, PhaseName::Prechecks | PhaseName::Work | PhaseName::Postchecks) {
            return;
        }

        let logs = plan
            .node_states
            .get(&node_id)
            .and_then(|s| s.attempt_history.last())
            .map(|a| a.logs.clone())
            .unwrap_or_default();
        let tail: String = logs.chars().rev().take(RETRY_LOG_TAIL_CHARS).collect::<Vec<_>>().into_iter().rev().collect();

        let instructions = format!(
            "Retrying the '{phase}' phase after a failure. Here is the tail of the previous \
             attempt's captured output:\n\n{tail}\n\nDiagnose and fix the problem, then make sure \
             this phase completes successfully."
        );
        let retry_spec = WorkSpec::Agent {
            instructions,
            model: None,
            allowed_folders: Vec::new(),
            allowed_urls: Vec::new(),
            resume_session,
            on_failure: None,
        };

        if let Some(node) = plan.nodes.get_mut(&node_id) {
            match phase {
                PhaseName::Prechecks => node.prechecks = Some(retry_spec),
                PhaseName::Work => node.work = Some(retry_spec),
                PhaseName::Postchecks => node.postchecks = Some(retry_spec),
                _ => {}
            }
        }
    }

    /// Forcibly fails a non-terminal node (spec.md §4.6 `forceFailNode`):
    /// kills its process if one is running, marks it failed, and blocks
    /// downstream the same way an ordinary failure would.
    pub async fn force_fail_node(&self, plan_id: PlanId, producer_id: &str) -> Result<()> {
        let plan_arc = self.get_plan(plan_id).await?;
        let mut plan = plan_arc.lock().await;

        let node_id = plan
            .node_id_for_producer(producer_id)
            .ok_or_else(|| anyhow!("unknown producer id '{producer_id}'"))?;
        let status = plan
            .node_states
            .get(&node_id)
            .map(|s| s.status)
            .ok_or_else(|| anyhow!("node '{producer_id}' has no execution state"))?;
        if status.is_terminal() {
            bail!("node '{producer_id}' is already terminal ({status})");
        }

        process_registry::kill(node_id);

        let was_running = status == NodeStatus::Running;
        if let Some(state) = plan.node_states.get_mut(&node_id) {
            if was_running {
                state.attempts += 1;
            }
            state.force_failed = true;
            state.pid = None;
        }

        self.sm.transition(
            &mut plan,
            node_id,
            NodeStatus::Failed,
            NodeUpdate {
                error: Some("force-failed by operator".to_string()),
                ..Default::default()
            },
        );
        self.events.publish(EngineEvent::NodeCompleted { plan_id, node_id, success: false });
        persistence::save(&self.store_dir, &plan)?;
        drop(plan);

        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(plan_id)
            .or_default()
            .remove(&node_id);
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> Result<Arc<AsyncMutex<PlanInstance>>> {
        self.plans
            .lock()
            .await
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown plan id '{plan_id}'"))
    }

    fn spawn_pump_loop(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = tokio::time::sleep(Duration::from_millis(500));
                tokio::select! {
                    _ = runner.notify.notified() => {}
                    _ = wait => {}
                }

                runner.drain_watch_events().await;

                let plan_ids: Vec<PlanId> = runner.plans.lock().await.keys().copied().collect();
                for plan_id in plan_ids {
                    runner.pump_once(plan_id).await;
                }
            }
        });
    }

    /// Reacts to any snapshot files removed out from under us (spec.md
    /// §4.7): drop the plan from memory and announce it the same way
    /// `delete` does, without re-touching the already-gone file.
    async fn drain_watch_events(&self) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        while let Some(event) = watcher.try_recv() {
            match event {
                WatchEvent::PlanDeleted(plan_id) => {
                    if self.plans.lock().await.remove(&plan_id).is_some() {
                        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).remove(&plan_id);
                        self.events.publish(EngineEvent::PlanDeleted { plan_id });
                    }
                }
                WatchEvent::Error(e) => {
                    tracing::warn!(error = %e, "plan store watcher error");
                }
            }
        }
    }

    /// One scheduling tick for a single plan (spec.md §4.6 scheduling
    /// pump): skip if paused/ended, collect `ready` nodes, admit up to
    /// `maxParallel` (minus what's already in flight), mark them
    /// `scheduled`, then hand each to the engine.
    async fn pump_once(self: &Arc<Self>, plan_id: PlanId) {
        let Some(plan_arc) = self.plans.lock().await.get(&plan_id).cloned() else {
            return;
        };

        let (ready, max_parallel) = {
            let plan = plan_arc.lock().await;
            if plan.is_paused || plan.ended_at.is_some() {
                return;
            }
            let mut ids: Vec<NodeId> = plan
                .node_states
                .iter()
                .filter(|(_, s)| s.status == NodeStatus::Ready)
                .map(|(id, _)| *id)
                .collect();
            ids.sort();
            (ids, plan.max_parallel)
        };
        if ready.is_empty() {
            return;
        }

        let already_inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&plan_id)
            .map(|s| s.len())
            .unwrap_or(0);
        let slots = max_parallel.saturating_sub(already_inflight);
        let selected: Vec<NodeId> = ready.into_iter().take(slots).collect();
        if selected.is_empty() {
            return;
        }

        {
            let mut plan = plan_arc.lock().await;
            for node_id in &selected {
                self.sm.transition(&mut plan, *node_id, NodeStatus::Scheduled, NodeUpdate::default());
            }
            if let Err(e) = persistence::save(&self.store_dir, &plan) {
                tracing::warn!(%plan_id, error = %e, "failed to persist plan after scheduling nodes");
            }
        }

        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.entry(plan_id).or_default().extend(selected.iter().copied());
        }

        for node_id in selected {
            let runner = Arc::clone(self);
            let plan_arc = Arc::clone(&plan_arc);
            tokio::spawn(async move {
                let _permit = match &runner.global_semaphore {
                    Some(sem) => sem.clone().acquire_owned().await.ok(),
                    None => None,
                };

                {
                    let mut plan = plan_arc.lock().await;
                    runner.engine.execute_job(&mut plan, node_id).await;
                    if let Err(e) = persistence::save(&runner.store_dir, &plan) {
                        tracing::warn!(%plan_id, %node_id, error = %e, "failed to persist plan after job execution");
                    }
                }

                if let Some(set) = runner.inflight.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&plan_id) {
                    set.remove(&node_id);
                }
                runner.notify.notify_one();
            });
        }
    }
}

/// Aggregate usage metrics across every node that has run, for a plan's
/// status report — sums each node's `metrics` (spec.md §7 "Stats parser
/// output feeds plan-level usage reporting").
pub fn aggregate_usage(plan: &PlanInstance) -> stats::UsageMetrics {
    let mut total = stats::UsageMetrics::default();
    for state in plan.node_states.values() {
        if let Some(metrics) = &state.metrics {
            total.merge(metrics);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Instant;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::agent::{AgentRunOptions, AgentRunResult, AgentRunner};
    use crate::domain::{JobSpec, PlanSpec};
    use crate::git::GitManager;

    fn git(dir: &std::path::Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().expect("run git");
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

    struct NoopAgent;

    #[async_trait]
    impl AgentRunner for NoopAgent {
        async fn run(
            &self,
            _options: AgentRunOptions,
            _on_output: mpsc::Sender<String>,
            on_process: Box<dyn FnOnce(u32) + Send>,
        ) -> anyhow::Result<AgentRunResult> {
            on_process(std::process::id());
            Ok(AgentRunResult {
                success: true,
                session_id: None,
                exit_code: Some(0),
                error: None,
                metrics: None,
                killed_by_signal: false,
            })
        }

        fn id(&self) -> &str {
            "noop"
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn job(producer_id: &str, work: &str, auto_heal: bool) -> JobSpec {
        JobSpec {
            producer_id: producer_id.to_string(),
            name: None,
            task: "do something".to_string(),
            work: Some(WorkSpec::Plain(work.to_string())),
            prechecks: None,
            postchecks: None,
            instructions: None,
            dependencies: vec![],
            base_branch: None,
            expects_no_changes: false,
            auto_heal,
            group: None,
        }
    }

    fn make_runner(repo: &std::path::Path, store_dir: &std::path::Path) -> (Arc<PlanRunner>, Arc<EventBus>) {
        let git: Arc<dyn GitOps> = Arc::new(GitManager::new(repo).expect("git manager"));
        let events = Arc::new(EventBus::new());
        let sm = Arc::new(PlanStateMachine::new(events.clone()));
        let engine = Arc::new(JobEngine::new(
            git.clone(),
            Arc::new(NoopAgent),
            sm.clone(),
            events.clone(),
            EngineConfig::default(),
        ));
        let config = EngineConfig::default();
        let runner = PlanRunner::new(engine, git, sm, events.clone(), store_dir.to_path_buf(), &config, None);
        (runner, events)
    }

    async fn wait_for_plan_end(runner: &Arc<PlanRunner>, plan_id: PlanId) -> PlanInstance {
        let start = Instant::now();
        loop {
            let snapshot = runner.snapshot(plan_id).await.expect("plan exists");
            if snapshot.ended_at.is_some() {
                return snapshot;
            }
            assert!(start.elapsed() < Duration::from_secs(10), "plan did not finish in time");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn single_job_spec(repo: &std::path::Path, name: &str, work: &str, auto_heal: bool) -> PlanSpec {
        PlanSpec {
            name: name.to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            repo_path: Some(repo.to_path_buf()),
            worktree_root: Some(repo.join(".railyard/worktrees")),
            max_parallel: 4,
            clean_up_successful_work: false,
            jobs: vec![job("a", work, auto_heal)],
            groups: vec![],
        }
    }

    #[tokio::test]
    async fn enqueue_and_start_runs_a_single_job_plan_to_completion() {
        let repo = init_repo();
        let store_dir = TempDir::new().unwrap();
        let (runner, _events) = make_runner(repo.path(), store_dir.path());

        let spec = single_job_spec(repo.path(), "runs-to-completion", "echo hi > output.txt", true);
        let plan_id = runner.enqueue(spec, BuildOptions::default()).await.expect("enqueue");
        runner.start(plan_id).await.expect("start");

        let snapshot = wait_for_plan_end(&runner, plan_id).await;
        let node_id = snapshot.node_id_for_producer("a").unwrap();
        assert_eq!(snapshot.node_states[&node_id].status, NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn retry_node_reruns_a_failed_node_with_replacement_work() {
        let repo = init_repo();
        let store_dir = TempDir::new().unwrap();
        let (runner, _events) = make_runner(repo.path(), store_dir.path());

        let spec = single_job_spec(repo.path(), "retry-me", "exit 1", false);
        let plan_id = runner.enqueue(spec, BuildOptions::default()).await.expect("enqueue");
        runner.start(plan_id).await.expect("start");

        let snapshot = wait_for_plan_end(&runner, plan_id).await;
        let node_id = snapshot.node_id_for_producer("a").unwrap();
        assert_eq!(snapshot.node_states[&node_id].status, NodeStatus::Failed);

        runner
            .retry_node(
                plan_id,
                "a",
                RetryOptions {
                    new_work: Some(WorkSpec::Plain("echo fixed > output.txt".to_string())),
                    new_prechecks: None,
                    new_postchecks: None,
                    clear_worktree: false,
                    resume_session: false,
                },
            )
            .await
            .expect("retry");

        let snapshot = wait_for_plan_end(&runner, plan_id).await;
        assert_eq!(snapshot.node_states[&node_id].status, NodeStatus::Succeeded);
        assert!(snapshot.node_states[&node_id]
            .attempt_history
            .iter()
            .any(|a| a.trigger_type == AttemptTrigger::Retry));
    }

    #[tokio::test]
    async fn force_fail_node_marks_a_non_terminal_node_failed() {
        let repo = init_repo();
        let store_dir = TempDir::new().unwrap();
        let (runner, _events) = make_runner(repo.path(), store_dir.path());

        let spec = single_job_spec(repo.path(), "force-fail", "echo hi > output.txt", true);
        let plan_id = runner.enqueue(spec, BuildOptions::default()).await.expect("enqueue");
        // deliberately not started: the node is still `ready`, a non-terminal status.

        runner.force_fail_node(plan_id, "a").await.expect("force fail");

        let snapshot = runner.snapshot(plan_id).await.unwrap();
        let node_id = snapshot.node_id_for_producer("a").unwrap();
        let state = &snapshot.node_states[&node_id];
        assert_eq!(state.status, NodeStatus::Failed);
        assert!(state.force_failed);
    }

    #[tokio::test]
    async fn pause_stops_scheduling_until_resumed() {
        let repo = init_repo();
        let store_dir = TempDir::new().unwrap();
        let (runner, _events) = make_runner(repo.path(), store_dir.path());

        let spec = single_job_spec(repo.path(), "paused", "echo hi > output.txt", true);
        let plan_id = runner.enqueue(spec, BuildOptions::default()).await.expect("enqueue");
        // Pause immediately: enqueue doesn't itself wake the pump, but the
        // loop also ticks on a plain 500ms timer independent of start(), so
        // pausing before that first tick is what keeps the node `ready`.
        runner.pause(plan_id).await.expect("pause");

        tokio::time::sleep(Duration::from_millis(600)).await;
        let snapshot = runner.snapshot(plan_id).await.unwrap();
        let node_id = snapshot.node_id_for_producer("a").unwrap();
        assert_eq!(
            snapshot.node_states[&node_id].status,
            NodeStatus::Ready,
            "a paused plan should not have scheduled its ready node"
        );

        runner.resume(plan_id).await.expect("resume");
        let snapshot = wait_for_plan_end(&runner, plan_id).await;
        assert_eq!(snapshot.node_states[&node_id].status, NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn delete_removes_the_plan_and_its_snapshot() {
        let repo = init_repo();
        let store_dir = TempDir::new().unwrap();
        let (runner, _events) = make_runner(repo.path(), store_dir.path());

        let spec = single_job_spec(repo.path(), "to-delete", "echo hi > output.txt", true);
        let plan_id = runner.enqueue(spec, BuildOptions::default()).await.expect("enqueue");
        assert!(runner.list_plan_ids().await.contains(&plan_id));

        runner.delete(plan_id).await.expect("delete");

        assert!(!runner.list_plan_ids().await.contains(&plan_id));
        assert!(runner.snapshot(plan_id).await.is_err());
        assert!(persistence::load(store_dir.path(), plan_id).is_err());
    }
}
