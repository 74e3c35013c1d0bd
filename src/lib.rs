//! railyard runs DAG-shaped plans of code-change jobs, each in its own
//! isolated git worktree, merging work forward and back between
//! dependent jobs and recovering cleanly from a crash mid-plan.

pub mod agent;
pub mod builder;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod git;
pub mod persistence;
pub mod reshaper;
pub mod scheduler;
pub mod state_machine;
pub mod stats;
pub mod watcher;

pub use domain::*;
