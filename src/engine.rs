//! Job Execution Engine (spec.md §4.5): drives one node's attempt through
//! worktree setup, the phase executor, auto-heal, and worktree GC.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::agent::{process_registry, AgentRunner};
use crate::config::EngineConfig;
use crate::domain::{
    AttemptRecord, AttemptTrigger, NodeId, NodeStatus, PhaseName, PlanInstance, PlanNode,
    StepStatus, WorkSpec,
};
use crate::events::{EngineEvent, EventBus};
use crate::executor::{ExecutionContext, OutputCallback, PhaseCallbacks, PhaseExecutor, PhaseOutcome, ProcessCallback, StepStatusCallback};
use crate::git::{DiffSettings, GitOps};
use crate::state_machine::{NodeUpdate, PlanStateMachine};

/// Owns the git/agent facades and the process-wide reverse-integration
/// lock; stateless across calls beyond that lock.
pub struct JobEngine {
    git: Arc<dyn GitOps>,
    agent: Arc<dyn AgentRunner>,
    sm: Arc<PlanStateMachine>,
    events: Arc<EventBus>,
    config: EngineConfig,
    ri_lock: tokio::sync::Mutex<()>,
    /// Output captured for the attempt currently in flight, staged here
    /// until the attempt finishes and its `AttemptRecord` is built.
    pending_logs: Mutex<HashMap<NodeId, String>>,
}

impl JobEngine {
    pub fn new(
        git: Arc<dyn GitOps>,
        agent: Arc<dyn AgentRunner>,
        sm: Arc<PlanStateMachine>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            git,
            agent,
            sm,
            events,
            config,
            ri_lock: tokio::sync::Mutex::new(()),
            pending_logs: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one attempt for `node_id` to completion (success, failure, or
    /// an auto-healed retry of either), mutating `plan` in place and
    /// leaving it in a state ready to be persisted by the caller.
    pub async fn execute_job(&self, plan: &mut PlanInstance, node_id: NodeId) {
        let plan_id = plan.id;

        // 1. Transition to running, bump attempts, capture started_at via sm.
        self.sm.transition(plan, node_id, NodeStatus::Running, NodeUpdate::default());
        let attempt_number = {
            let state = plan.node_states.get_mut(&node_id).expect("node exists");
            state.attempts += 1;
            state.attempts
        };
        self.events.publish(EngineEvent::NodeStarted { plan_id, node_id });

        // 2. Base commit resolution: the first dependency's completed commit,
        // else this job's own base-branch override, else the plan's.
        let base_commits = self.sm.get_base_commits_for_node(plan, node_id);
        let base_commitish = base_commits.first().cloned().unwrap_or_else(|| {
            plan.nodes
                .get(&node_id)
                .and_then(|n| n.base_branch.clone())
                .unwrap_or_else(|| plan.base_branch.clone())
        });
        let dependency_commits: Vec<String> = base_commits.into_iter().skip(1).collect();

        // 3. Worktree setup.
        let worktree_root = plan.worktree_root.clone();
        let worktree_info = match self.git.create_or_reuse_detached(&worktree_root, node_id, &base_commitish) {
            Ok(info) => info,
            Err(e) => {
                let trigger = plan
                    .node_states
                    .get_mut(&node_id)
                    .and_then(|s| s.next_attempt_trigger.take())
                    .unwrap_or(AttemptTrigger::Initial);
                self.finalize_failure(
                    plan,
                    node_id,
                    trigger,
                    attempt_number,
                    PhaseName::MergeFi,
                    e.to_string(),
                    None,
                    BTreeMap::new(),
                    PathBuf::new(),
                    base_commitish.clone(),
                    None,
                )
                .await;
                return;
            }
        };

        let had_base_commit = plan
            .node_states
            .get(&node_id)
            .and_then(|s| s.base_commit.clone());
        let resolved_base_commit = if worktree_info.reused {
            had_base_commit.unwrap_or_else(|| worktree_info.base_commit.clone())
        } else {
            worktree_info.base_commit.clone()
        };
        {
            let state = plan.node_states.get_mut(&node_id).expect("node exists");
            state.base_commit = Some(resolved_base_commit.clone());
            state.worktree_path = Some(worktree_info.path.clone());
        }
        if plan.base_commit_at_start.is_none() {
            plan.base_commit_at_start = Some(worktree_info.base_commit.clone());
        }

        // 4. Acknowledge consumption, then GC.
        let dependencies = plan
            .nodes
            .get(&node_id)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default();
        for dep in &dependencies {
            if let Some(dep_state) = plan.node_states.get_mut(dep) {
                dep_state.consumed_by_dependents.insert(node_id);
            }
        }
        if plan.clean_up_successful_work {
            self.cleanup_eligible_worktrees(plan).await;
        }

        // 5. Executor invocation (unless only merge-ri is left to run).
        let node = plan.nodes.get(&node_id).expect("node exists").clone();
        let (resume_from_phase, previous_step_statuses, copilot_session_id) = {
            let state = plan.node_states.get(&node_id).expect("node exists");
            (state.resume_from_phase, state.step_statuses.clone(), state.copilot_session_id.clone())
        };
        let is_leaf = plan.is_leaf(node_id);
        let target_branch = if is_leaf { plan.target_branch.clone() } else { None };
        let worktree_path = worktree_info.path.clone();

        let outcome = if resume_from_phase == Some(PhaseName::MergeRi) {
            let mut carried = PhaseOutcome {
                success: true,
                completed_commit: plan.node_states.get(&node_id).and_then(|s| s.completed_commit.clone()),
                step_statuses: previous_step_statuses.clone(),
                ..Default::default()
            };
            carried.step_statuses.insert(PhaseName::MergeRi, StepStatus::Pending);
            carried
        } else {
            let ctx = self.build_context(
                &node,
                &worktree_path,
                &resolved_base_commit,
                &dependency_commits,
                attempt_number,
                copilot_session_id.clone(),
                resume_from_phase,
                previous_step_statuses.clone(),
            );
            let (callbacks, logs) = self.make_callbacks(plan_id, node_id);
            let executor = PhaseExecutor::new(self.git.as_ref(), self.agent.as_ref());
            let mut result = executor.run(&ctx, &callbacks).await;
            self.record_pending_logs(plan, node_id, &logs);
            process_registry::unregister(node_id);
            if result.completed_commit.is_none() && node.expects_no_changes && result.success {
                result.completed_commit = Some(resolved_base_commit.clone());
            }
            result
        };

        if !outcome.success {
            self.handle_executor_failure(plan, node_id, &node, attempt_number, &worktree_path, &resolved_base_commit, outcome)
                .await;
            return;
        }

        // Persist the pre-RI state now, so a crash between here and the RI
        // merge resumes cleanly from 'merge-ri' instead of redoing the work.
        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.completed_commit = outcome.completed_commit.clone();
            state.step_statuses = outcome.step_statuses.clone();
            state.copilot_session_id = outcome.copilot_session_id.clone().or(state.copilot_session_id.clone());
            if target_branch.is_some() {
                state.resume_from_phase = Some(PhaseName::MergeRi);
            }
        }

        // Reverse integration, if this is a leaf with a target branch.
        let mut final_outcome = outcome;
        if target_branch.is_some() && final_outcome.step_statuses.get(&PhaseName::MergeRi) != Some(&StepStatus::Success) {
            let target = target_branch.clone().unwrap();
            let completed_commit = final_outcome
                .completed_commit
                .clone()
                .unwrap_or_else(|| resolved_base_commit.clone());

            let ri_result = {
                let _guard = self.ri_lock.lock().await;
                let executor = PhaseExecutor::new(self.git.as_ref(), self.agent.as_ref());
                executor.run_merge_ri(&target, &completed_commit)
            };

            match ri_result {
                Ok(()) => {
                    final_outcome.step_statuses.insert(PhaseName::MergeRi, StepStatus::Success);
                    if let Some(state) = plan.node_states.get_mut(&node_id) {
                        state.merged_to_target = true;
                    }
                }
                Err(failure) => {
                    final_outcome.step_statuses.insert(PhaseName::MergeRi, StepStatus::Failed);
                    self.handle_executor_failure(
                        plan,
                        node_id,
                        &node,
                        attempt_number,
                        &worktree_path,
                        &resolved_base_commit,
                        PhaseOutcome {
                            success: false,
                            failed_phase: Some(PhaseName::MergeRi),
                            error: Some(failure.message),
                            exit_code: failure.exit_code,
                            step_statuses: final_outcome.step_statuses.clone(),
                            ..Default::default()
                        },
                    )
                    .await;
                    return;
                }
            }
        }

        self.finalize_success(plan, node_id, &node, attempt_number, &worktree_path, &resolved_base_commit, final_outcome)
            .await;
    }

    fn build_context(
        &self,
        node: &PlanNode,
        worktree_path: &std::path::Path,
        base_commit: &str,
        dependency_commits: &[String],
        attempt_number: u32,
        copilot_session_id: Option<String>,
        resume_from_phase: Option<PhaseName>,
        previous_step_statuses: BTreeMap<PhaseName, StepStatus>,
    ) -> ExecutionContext {
        ExecutionContext {
            node_id: node.id,
            task: node.task.clone(),
            worktree_path: worktree_path.to_path_buf(),
            base_commit: base_commit.to_string(),
            dependency_commits: dependency_commits.to_vec(),
            attempt_number,
            copilot_session_id,
            resume_from_phase,
            previous_step_statuses,
            expects_no_changes: node.expects_no_changes,
            prechecks: node.prechecks.clone(),
            work: node.work.clone(),
            postchecks: node.postchecks.clone(),
            agent_timeout: Duration::from_secs(self.config.agent_timeout_secs),
            agent_log_dir: None,
            agent_config_dir: None,
        }
    }

    fn make_callbacks(&self, plan_id: crate::domain::PlanId, node_id: NodeId) -> (PhaseCallbacks, Arc<Mutex<String>>) {
        let logs = Arc::new(Mutex::new(String::new()));

        let logs_clone = logs.clone();
        let on_output: OutputCallback = Arc::new(move |line: &str| {
            let mut buf = logs_clone.lock().unwrap_or_else(|e| e.into_inner());
            buf.push_str(line);
            buf.push('\n');
        });

        let events = self.events.clone();
        let on_step_status: StepStatusCallback = Arc::new(move |phase, status| {
            events.publish(EngineEvent::NodeStepStatus {
                plan_id,
                node_id,
                phase,
                status,
            });
        });

        let on_process: ProcessCallback = Arc::new(move |pid: u32| {
            process_registry::register(node_id, pid, "agent");
        });

        (
            PhaseCallbacks {
                on_step_status,
                on_output,
                on_process,
            },
            logs,
        )
    }

    fn record_pending_logs(&self, plan: &mut PlanInstance, node_id: NodeId, logs: &Arc<Mutex<String>>) {
        let captured = logs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.pid = None;
            let _ = &captured;
        }
        self.pending_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id, captured);
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_executor_failure(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        node: &PlanNode,
        attempt_number: u32,
        worktree_path: &std::path::Path,
        base_commit: &str,
        outcome: PhaseOutcome,
    ) {
        let failed_phase = outcome.failed_phase.unwrap_or(PhaseName::Work);

        let heal_decision = self.decide_auto_heal(plan, node_id, node, failed_phase, outcome.signal_killed);

        if let Some(heal) = heal_decision {
            self.record_initial_failure_attempt(
                plan,
                node_id,
                node,
                attempt_number,
                failed_phase,
                worktree_path,
                base_commit,
                &outcome,
            );

            let heal_result = self
                .run_heal_attempt(plan, node_id, node, failed_phase, attempt_number, worktree_path, base_commit, heal)
                .await;

            let healed_attempt_number =
                plan.node_states.get(&node_id).map(|s| s.attempts).unwrap_or(attempt_number);
            match heal_result {
                Ok(healed_outcome) => {
                    self.finalize_success(
                        plan,
                        node_id,
                        node,
                        healed_attempt_number,
                        worktree_path,
                        base_commit,
                        healed_outcome,
                    )
                    .await;
                }
                Err(failed_outcome) => {
                    self.finalize_failure_from_outcome(
                        plan,
                        node_id,
                        node,
                        healed_attempt_number,
                        worktree_path,
                        base_commit,
                        failed_outcome,
                    )
                    .await;
                }
            }
            return;
        }

        self.finalize_failure_from_outcome(plan, node_id, node, attempt_number, worktree_path, base_commit, outcome)
            .await;
    }

    /// Appends the attempt record for the failure that triggered auto-heal
    /// (§8 scenario 3: the history must keep both the failed initial
    /// attempt and the healed retry, not just the latter). Pushes only the
    /// `AttemptRecord` — the node stays non-terminal, so no transition or
    /// `nodeCompleted` event fires here.
    #[allow(clippy::too_many_arguments)]
    fn record_initial_failure_attempt(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        node: &PlanNode,
        attempt_number: u32,
        failed_phase: PhaseName,
        worktree_path: &std::path::Path,
        base_commit: &str,
        outcome: &PhaseOutcome,
    ) {
        let now = Utc::now();
        let logs = self
            .pending_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node_id)
            .unwrap_or_default();
        let truncated_logs: String = logs.chars().rev().take(4000).collect::<Vec<_>>().into_iter().rev().collect();

        let trigger = plan
            .node_states
            .get_mut(&node_id)
            .and_then(|s| s.next_attempt_trigger.take())
            .unwrap_or_else(|| {
                if plan
                    .node_states
                    .get(&node_id)
                    .map(|s| s.auto_heal_attempted.is_empty())
                    .unwrap_or(true)
                {
                    AttemptTrigger::Initial
                } else {
                    AttemptTrigger::AutoHeal
                }
            });

        let state = plan.node_states.get_mut(&node_id).expect("node exists");
        state.attempt_history.push(AttemptRecord {
            attempt_number,
            trigger_type: trigger,
            status: NodeStatus::Failed,
            started_at: state.started_at.unwrap_or(now),
            ended_at: Some(now),
            failed_phase: Some(failed_phase),
            error: outcome.error.clone(),
            exit_code: outcome.exit_code,
            copilot_session_id: state.copilot_session_id.clone(),
            step_statuses: outcome.step_statuses.clone(),
            worktree_path: worktree_path.to_path_buf(),
            base_commit: base_commit.to_string(),
            completed_commit: None,
            logs: truncated_logs,
            log_file_path: None,
            work_used: match failed_phase {
                PhaseName::Prechecks => node.prechecks.clone(),
                PhaseName::Work => node.work.clone(),
                PhaseName::Postchecks => node.postchecks.clone(),
                _ => None,
            },
            metrics: None,
            phase_metrics: BTreeMap::new(),
        });
    }

    /// Returns `Some(is_agent_killed_retry)` if auto-heal applies.
    fn decide_auto_heal(
        &self,
        plan: &PlanInstance,
        node_id: NodeId,
        node: &PlanNode,
        failed_phase: PhaseName,
        signal_killed: bool,
    ) -> Option<bool> {
        if !matches!(failed_phase, PhaseName::Prechecks | PhaseName::Work | PhaseName::Postchecks) {
            return None;
        }

        let spec = match failed_phase {
            PhaseName::Prechecks => node.prechecks.as_ref(),
            PhaseName::Work => node.work.as_ref(),
            PhaseName::Postchecks => node.postchecks.as_ref(),
            _ => None,
        };
        let no_auto_heal = spec.and_then(|s| s.on_failure()).map(|p| p.no_auto_heal).unwrap_or(false);
        if !node.auto_heal || no_auto_heal {
            return None;
        }

        let already_attempted = plan
            .node_states
            .get(&node_id)
            .map(|s| s.auto_heal_attempted.contains(&failed_phase))
            .unwrap_or(true);
        if already_attempted {
            return None;
        }

        let is_agent = spec.map(|s| s.is_agent()).unwrap_or(false);
        if is_agent {
            if signal_killed {
                Some(true)
            } else {
                None
            }
        } else {
            Some(false)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_heal_attempt(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        node: &PlanNode,
        failed_phase: PhaseName,
        attempt_number: u32,
        worktree_path: &std::path::Path,
        base_commit: &str,
        is_agent_killed_retry: bool,
    ) -> Result<PhaseOutcome, PhaseOutcome> {
        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.auto_heal_attempted.insert(failed_phase);
        }

        let mut healed_node = node.clone();
        if !is_agent_killed_retry {
            let original_spec = match failed_phase {
                PhaseName::Prechecks => healed_node.prechecks.clone(),
                PhaseName::Work => healed_node.work.clone(),
                PhaseName::Postchecks => healed_node.postchecks.clone(),
                _ => None,
            };
            let heal_spec = WorkSpec::Agent {
                instructions: heal_instructions(failed_phase, original_spec.as_ref()),
                model: None,
                allowed_folders: vec![],
                allowed_urls: vec![],
                resume_session: false,
                on_failure: None,
            };
            match failed_phase {
                PhaseName::Prechecks => healed_node.prechecks = Some(heal_spec),
                PhaseName::Work => healed_node.work = Some(heal_spec),
                PhaseName::Postchecks => healed_node.postchecks = Some(heal_spec),
                _ => {}
            }
            if let Some(plan_node) = plan.nodes.get_mut(&node_id) {
                match failed_phase {
                    PhaseName::Prechecks => plan_node.prechecks = healed_node.prechecks.clone(),
                    PhaseName::Work => plan_node.work = healed_node.work.clone(),
                    PhaseName::Postchecks => plan_node.postchecks = healed_node.postchecks.clone(),
                    _ => {}
                }
            }
            let state = plan.node_states.get_mut(&node_id).expect("node exists");
            state.attempts += 1;
        }

        let (resume_from_phase, previous_step_statuses, copilot_session_id) = {
            let state = plan.node_states.get(&node_id).expect("node exists");
            (Some(failed_phase), state.step_statuses.clone(), state.copilot_session_id.clone())
        };

        let ctx = self.build_context(
            &healed_node,
            worktree_path,
            base_commit,
            &[],
            plan.node_states.get(&node_id).map(|s| s.attempts).unwrap_or(attempt_number),
            copilot_session_id,
            resume_from_phase,
            previous_step_statuses,
        );
        let (callbacks, logs) = self.make_callbacks(plan.id, node_id);
        let executor = PhaseExecutor::new(self.git.as_ref(), self.agent.as_ref());
        let mut result = executor.run(&ctx, &callbacks).await;
        self.record_pending_logs(plan, node_id, &logs);
        process_registry::unregister(node_id);

        if let Some(plan_node) = plan.nodes.get_mut(&node_id) {
            match failed_phase {
                PhaseName::Prechecks => plan_node.prechecks = node.prechecks.clone(),
                PhaseName::Work => plan_node.work = node.work.clone(),
                PhaseName::Postchecks => plan_node.postchecks = node.postchecks.clone(),
                _ => {}
            }
        }

        if result.completed_commit.is_none() && node.expects_no_changes {
            result.completed_commit = Some(base_commit.to_string());
        }

        if result.success {
            Ok(result)
        } else {
            Err(result)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        node: &PlanNode,
        attempt_number: u32,
        worktree_path: &std::path::Path,
        base_commit: &str,
        outcome: PhaseOutcome,
    ) {
        let now = Utc::now();
        let completed_commit = outcome.completed_commit.clone();

        let job_summary = self.compute_job_summary(worktree_path, base_commit, &completed_commit);
        plan.work_summary.add_assign(&job_summary);

        let is_leaf = plan.is_leaf(node_id);
        let aggregated = if is_leaf { outcome.work_summary.clone() } else { None };

        let logs = self
            .pending_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node_id)
            .unwrap_or_default();
        let truncated_logs: String = logs.chars().rev().take(4000).collect::<Vec<_>>().into_iter().rev().collect();

        {
            let state = plan.node_states.get_mut(&node_id).expect("node exists");
            state.completed_commit = completed_commit.clone();
            state.work_commit = completed_commit.clone();
            state.step_statuses = outcome.step_statuses.clone();
            state.copilot_session_id = outcome.copilot_session_id.clone().or(state.copilot_session_id.clone());
            state.work_summary = outcome.work_summary.clone();
            state.aggregated_work_summary = aggregated;
            state.metrics = outcome.work_summary.clone();
            state.phase_metrics = outcome.phase_metrics.clone();
            state.resume_from_phase = None;
            state.pid = None;

            let trigger = state.next_attempt_trigger.take().unwrap_or_else(|| {
                if state.auto_heal_attempted.is_empty() {
                    AttemptTrigger::Initial
                } else {
                    AttemptTrigger::AutoHeal
                }
            });
            state.attempt_history.push(AttemptRecord {
                attempt_number,
                trigger_type: trigger,
                status: NodeStatus::Succeeded,
                started_at: state.started_at.unwrap_or(now),
                ended_at: Some(now),
                failed_phase: None,
                error: None,
                exit_code: None,
                copilot_session_id: state.copilot_session_id.clone(),
                step_statuses: outcome.step_statuses.clone(),
                worktree_path: worktree_path.to_path_buf(),
                base_commit: base_commit.to_string(),
                completed_commit: completed_commit.clone(),
                logs: truncated_logs,
                log_file_path: None,
                work_used: node.work.clone(),
                metrics: outcome.work_summary.clone(),
                phase_metrics: outcome.phase_metrics.clone(),
            });
        }

        self.sm.transition(
            plan,
            node_id,
            NodeStatus::Succeeded,
            NodeUpdate {
                completed_commit,
                ..Default::default()
            },
        );
        self.events.publish(EngineEvent::NodeCompleted {
            plan_id: plan.id,
            node_id,
            success: true,
        });

        let target_branch = plan.target_branch.clone();
        let should_clean = plan.clean_up_successful_work
            && is_leaf
            && (target_branch.is_none()
                || plan.node_states.get(&node_id).map(|s| s.merged_to_target).unwrap_or(false));
        if should_clean {
            self.clean_worktree(plan, node_id, worktree_path);
        }

        if plan.clean_up_successful_work {
            self.cleanup_eligible_worktrees(plan).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_failure_from_outcome(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        node: &PlanNode,
        attempt_number: u32,
        worktree_path: &std::path::Path,
        base_commit: &str,
        outcome: PhaseOutcome,
    ) {
        let trigger = plan
            .node_states
            .get_mut(&node_id)
            .and_then(|s| s.next_attempt_trigger.take())
            .unwrap_or_else(|| {
                if plan
                    .node_states
                    .get(&node_id)
                    .map(|s| s.auto_heal_attempted.is_empty())
                    .unwrap_or(true)
                {
                    AttemptTrigger::Initial
                } else {
                    AttemptTrigger::AutoHeal
                }
            });
        self.finalize_failure(
            plan,
            node_id,
            trigger,
            attempt_number,
            outcome.failed_phase.unwrap_or(PhaseName::Work),
            outcome.error.clone().unwrap_or_else(|| "job failed".to_string()),
            outcome.exit_code,
            outcome.step_statuses.clone(),
            worktree_path.to_path_buf(),
            base_commit.to_string(),
            Some(node),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_failure(
        &self,
        plan: &mut PlanInstance,
        node_id: NodeId,
        trigger: AttemptTrigger,
        attempt_number: u32,
        failed_phase: PhaseName,
        error: String,
        exit_code: Option<i32>,
        step_statuses: BTreeMap<PhaseName, StepStatus>,
        worktree_path: PathBuf,
        base_commit: String,
        node: Option<&PlanNode>,
    ) {
        let now = Utc::now();

        let logs = self
            .pending_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node_id)
            .unwrap_or_default();
        let truncated_logs: String = logs.chars().rev().take(4000).collect::<Vec<_>>().into_iter().rev().collect();

        {
            let state = plan.node_states.get_mut(&node_id).expect("node exists");
            state.error = Some(error.clone());
            state.last_attempt_phase = Some(failed_phase);
            state.step_statuses = step_statuses.clone();
            state.pid = None;

            state.attempt_history.push(AttemptRecord {
                attempt_number,
                trigger_type: trigger,
                status: NodeStatus::Failed,
                started_at: state.started_at.unwrap_or(now),
                ended_at: Some(now),
                failed_phase: Some(failed_phase),
                error: Some(error.clone()),
                exit_code,
                copilot_session_id: state.copilot_session_id.clone(),
                step_statuses,
                worktree_path,
                base_commit,
                completed_commit: None,
                logs: truncated_logs,
                log_file_path: None,
                work_used: node.and_then(|n| match failed_phase {
                    PhaseName::Prechecks => n.prechecks.clone(),
                    PhaseName::Work => n.work.clone(),
                    PhaseName::Postchecks => n.postchecks.clone(),
                    _ => None,
                }),
                metrics: None,
                phase_metrics: BTreeMap::new(),
            });
        }

        self.sm.transition(
            plan,
            node_id,
            NodeStatus::Failed,
            NodeUpdate {
                error: Some(error),
                ..Default::default()
            },
        );
        self.events.publish(EngineEvent::NodeCompleted {
            plan_id: plan.id,
            node_id,
            success: false,
        });
    }

    fn compute_job_summary(
        &self,
        worktree_path: &std::path::Path,
        base_commit: &str,
        completed_commit: &Option<String>,
    ) -> crate::domain::WorkSummary {
        let mut summary = crate::domain::WorkSummary::default();
        let Some(completed) = completed_commit else {
            return summary;
        };
        if completed == base_commit {
            return summary;
        }
        summary.total_commits = 1;
        match self.git.diff_report(worktree_path, Some(base_commit), &DiffSettings::default()) {
            Ok(report) => {
                summary.lines_added = report.total_added as u64;
                summary.lines_removed = report.total_removed as u64;
                summary.files_changed = report.files_changed as u64;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to compute job diff summary");
            }
        }
        summary
    }

    fn clean_worktree(&self, plan: &mut PlanInstance, node_id: NodeId, worktree_path: &std::path::Path) {
        match self.git.remove_worktree_safe(worktree_path, true) {
            Ok(()) => {
                if let Some(state) = plan.node_states.get_mut(&node_id) {
                    state.worktree_cleaned_up = true;
                }
            }
            Err(e) => {
                tracing::warn!(%node_id, error = %e, "failed to remove worktree during GC");
            }
        }
    }

    /// Worktree GC pass (spec.md §4.5.9): removes worktrees for succeeded
    /// nodes once every consumer has consumed them.
    pub async fn cleanup_eligible_worktrees(&self, plan: &mut PlanInstance) {
        let candidates: Vec<NodeId> = plan
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Succeeded && !s.worktree_cleaned_up && s.worktree_path.is_some())
            .map(|(id, _)| *id)
            .collect();

        for node_id in candidates {
            let is_leaf = plan.is_leaf(node_id);
            let eligible = if is_leaf {
                plan.target_branch.is_none()
                    || plan.node_states.get(&node_id).map(|s| s.merged_to_target).unwrap_or(false)
            } else {
                let dependents = plan.nodes.get(&node_id).map(|n| n.dependents.clone()).unwrap_or_default();
                let consumed = plan
                    .node_states
                    .get(&node_id)
                    .map(|s| s.consumed_by_dependents.clone())
                    .unwrap_or_default();
                dependents.iter().all(|d| consumed.contains(d))
            };

            if eligible {
                let worktree_path = plan.node_states.get(&node_id).and_then(|s| s.worktree_path.clone());
                if let Some(path) = worktree_path {
                    self.clean_worktree(plan, node_id, &path);
                }
            }
        }
    }
}


fn heal_instructions(phase: PhaseName, original: Option<&WorkSpec>) -> String {
    let original_desc = match original {
        Some(WorkSpec::Shell { command, .. }) => format!("a shell command (`{command}`)"),
        Some(WorkSpec::Process { executable, args, .. }) => {
            format!("a process invocation (`{executable} {}`)", args.join(" "))
        }
        Some(WorkSpec::Agent { instructions, .. }) => format!("an agent run with instructions:\n{instructions}"),
        Some(WorkSpec::Plain(cmd)) => format!("a shell command (`{cmd}`)"),
        None => "an unspecified step".to_string(),
    };
    format!(
        "The '{phase}' phase of this job just failed. It originally ran {original_desc}. \
         Inspect the worktree and the command's output, fix whatever is broken, and make sure \
         the phase can complete successfully when re-run."
    )
}
