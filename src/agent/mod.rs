//! Agent execution: the abstract `AgentRunner` facade, the real `copilot`
//! CLI adapter, the CLI availability/auth probe, and the running-process
//! registry `forceFailNode` uses to kill a node's subprocess.

mod cli_probe;
mod copilot;
pub mod process_registry;
mod runner;

pub use cli_probe::{
    build_copilot_command, global_cache, probe_auth_state, probe_copilot_cli_available,
    AuthState, AvailabilityCache, CopilotCommand,
};
pub use copilot::CopilotRunner;
pub use runner::{render_instructions_file, AgentRunOptions, AgentRunResult, AgentRunner};
