//! Minimal CLI surface over the plan engine (spec.md §1's "engine
//! event/persistence surface", not an embedding host's own UI): one
//! subcommand per `PlanRunner` entry point, for manual runs and
//! integration testing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent::{AgentRunner, CopilotRunner};
use crate::builder::BuildOptions;
use crate::config::EngineConfig;
use crate::domain::{PlanId, PlanInstance, PlanSpec};
use crate::engine::JobEngine;
use crate::events::{EngineEvent, EventBus};
use crate::git::{find_git_root, GitManager, GitOps};
use crate::scheduler::{PlanRunner, RetryOptions};
use crate::state_machine::PlanStateMachine;

#[derive(Parser)]
#[command(name = "railyard", about = "Runs DAG-shaped code-change plans over isolated git worktrees")]
pub struct Cli {
    /// Repository root; defaults to the git root containing the current directory.
    #[arg(long, global = true)]
    repo_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan lifecycle operations.
    #[command(subcommand)]
    Plan(PlanAction),
}

#[derive(Args)]
struct RetryFlags {
    /// Reset the node's worktree back to its base commit before retrying.
    /// Refused if a dependent has already merged this node's work.
    #[arg(long)]
    clear_worktree: bool,
    /// Ask the agent to resume its previous session rather than start fresh.
    #[arg(long)]
    resume_session: bool,
}

#[derive(Subcommand)]
enum PlanAction {
    /// Build a plan from a spec file (YAML or JSON) and run it to completion.
    Run { spec_file: PathBuf },
    /// Print a previously built plan's current status.
    Status { plan_id: Uuid },
    /// Reset a failed/blocked/canceled node and run the plan to completion.
    Retry {
        plan_id: Uuid,
        producer_id: String,
        #[command(flatten)]
        flags: RetryFlags,
    },
    /// Cancel every non-terminal node in a plan.
    Cancel { plan_id: Uuid },
    /// Pause a plan's scheduler (in-flight attempts finish; no new ones start).
    Pause { plan_id: Uuid },
    /// Unpause a plan and run it to completion.
    Resume { plan_id: Uuid },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let (runner, events) = build_runner(self.repo_path).await?;
        match self.command {
            Command::Plan(action) => run_plan_action(&runner, &events, action).await,
        }
    }
}

async fn run_plan_action(runner: &Arc<PlanRunner>, events: &Arc<EventBus>, action: PlanAction) -> Result<()> {
    match action {
        PlanAction::Run { spec_file } => {
            let spec = load_plan_spec(&spec_file)?;
            let mut rx = events.subscribe();
            let plan_id = runner.enqueue(spec, BuildOptions::default()).await?;
            runner.start(plan_id).await?;
            let plan = drive_to_completion(runner, &mut rx, plan_id).await?;
            print_plan_summary(&plan);
        }
        PlanAction::Status { plan_id } => {
            let plan = runner.snapshot(plan_id).await?;
            print_plan_summary(&plan);
        }
        PlanAction::Retry { plan_id, producer_id, flags } => {
            let mut rx = events.subscribe();
            runner
                .retry_node(
                    plan_id,
                    &producer_id,
                    RetryOptions {
                        new_work: None,
                        new_prechecks: None,
                        new_postchecks: None,
                        clear_worktree: flags.clear_worktree,
                        resume_session: flags.resume_session,
                    },
                )
                .await?;
            runner.start(plan_id).await?;
            let plan = drive_to_completion(runner, &mut rx, plan_id).await?;
            print_plan_summary(&plan);
        }
        PlanAction::Cancel { plan_id } => {
            runner.cancel(plan_id).await?;
            println!("plan {plan_id} canceled");
        }
        PlanAction::Pause { plan_id } => {
            runner.pause(plan_id).await?;
            println!("plan {plan_id} paused");
        }
        PlanAction::Resume { plan_id } => {
            let mut rx = events.subscribe();
            runner.resume(plan_id).await?;
            let plan = drive_to_completion(runner, &mut rx, plan_id).await?;
            print_plan_summary(&plan);
        }
    }
    Ok(())
}

async fn build_runner(repo_path: Option<PathBuf>) -> Result<(Arc<PlanRunner>, Arc<EventBus>)> {
    let repo_path = match repo_path {
        Some(p) => p,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_git_root(&cwd).unwrap_or(cwd)
        }
    };

    let config = EngineConfig::load(&repo_path).context("failed to load engine config")?;
    let git: Arc<dyn GitOps> = Arc::new(GitManager::new(repo_path.clone()).context("repository root is not a git repository")?);
    let agent: Arc<dyn AgentRunner> = Arc::new(CopilotRunner::new());
    let events = Arc::new(EventBus::new());
    let sm = Arc::new(PlanStateMachine::new(events.clone()));
    let engine = Arc::new(JobEngine::new(git.clone(), agent, sm.clone(), events.clone(), config.clone()));

    let store_dir = EngineConfig::config_dir(&repo_path).join("plans");
    let runner = PlanRunner::new(engine, git, sm, events.clone(), store_dir, &config, Some(500));
    runner.load_persisted().await?;

    Ok((runner, events))
}

fn load_plan_spec(path: &std::path::Path) -> Result<PlanSpec> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read plan spec file: {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).with_context(|| format!("failed to parse JSON plan spec: {}", path.display())),
        Some("yaml") | Some("yml") | None => {
            serde_yaml::from_str(&content).with_context(|| format!("failed to parse YAML plan spec: {}", path.display()))
        }
        Some(other) => bail!("unrecognized plan spec extension '{other}'; use .yaml, .yml, or .json"),
    }
}

/// Polls the plan's snapshot between events so a plan that finishes before
/// we subscribe (or between two event deliveries) is still noticed.
async fn drive_to_completion(
    runner: &Arc<PlanRunner>,
    rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    plan_id: PlanId,
) -> Result<PlanInstance> {
    loop {
        let plan = runner.snapshot(plan_id).await?;
        if plan.ended_at.is_some() {
            return Ok(plan);
        }

        match rx.recv().await {
            Some(EngineEvent::NodeStarted { plan_id: p, node_id }) if p == plan_id => {
                println!("  node {node_id} started");
            }
            Some(EngineEvent::NodeCompleted { plan_id: p, node_id, success }) if p == plan_id => {
                println!("  node {node_id} {}", if success { "succeeded" } else { "failed" });
            }
            Some(EngineEvent::PlanCompleted(completion)) if completion.plan_id == plan_id => {
                return runner.snapshot(plan_id).await;
            }
            Some(_) => continue,
            None => return runner.snapshot(plan_id).await,
        }
    }
}

fn print_plan_summary(plan: &PlanInstance) {
    let sm = PlanStateMachine::new(Arc::new(EventBus::new()));
    println!("plan {} ({}) — {}", plan.id, plan.spec.name, sm.derive_plan_status(plan));
    let mut producer_ids: Vec<&String> = plan.nodes.values().map(|n| &n.producer_id).collect();
    producer_ids.sort();
    for producer_id in producer_ids {
        let Some(node_id) = plan.node_id_for_producer(producer_id) else { continue };
        let Some(state) = plan.node_states.get(&node_id) else { continue };
        println!("  {producer_id:<24} {}", state.status);
        if let Some(error) = &state.error {
            println!("    error: {error}");
        }
    }
    println!(
        "work summary: {} commits, +{}/-{} across {} files",
        plan.work_summary.total_commits, plan.work_summary.lines_added, plan.work_summary.lines_removed, plan.work_summary.files_changed
    );
}
