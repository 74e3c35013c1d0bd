//! CLI availability/auth probe for the external coding-agent CLI (spec.md
//! §6 "CLI availability probe" / "Auth probe").
//!
//! Grounded on the teacher's process-spawning style (`std::process::Command`
//! with a captured output), generalized into a sequential multi-command probe
//! with a process-wide TTL-cached negative result, per spec.md §9 "Global
//! state... model each as an injectable context so tests can reset it."

use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

const NEGATIVE_TTL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cached {
    Positive,
    Negative(Instant),
}

/// Process-wide cache: positive results live forever, negative results for
/// 30s (spec.md §6). Exposed as an injectable struct rather than bare
/// statics so tests can construct their own instance.
pub struct AvailabilityCache {
    state: Mutex<Option<Cached>>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Returns the last cached value if any, else `false`, per spec.md §9's
    /// Open Question decision: "returns last cached value if any, else
    /// false" — no silent first-call optimism.
    pub fn cached(&self) -> bool {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(Cached::Positive) => true,
            Some(Cached::Negative(at)) => at.elapsed() < NEGATIVE_TTL,
            None => false,
        }
    }

    fn record(&self, available: bool) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(if available {
            Cached::Positive
        } else {
            Cached::Negative(Instant::now())
        });
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_CACHE: Lazy<AvailabilityCache> = Lazy::new(AvailabilityCache::new);

/// Process-wide singleton. Most callers want this; `AvailabilityCache` is
/// exposed separately so a test can construct an isolated instance.
pub fn global_cache() -> &'static AvailabilityCache {
    &GLOBAL_CACHE
}

fn probe_one(cmd: &str, args: &[&str]) -> bool {
    run_with_timeout(cmd, args)
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn run_with_timeout(cmd: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
    // `std::process::Command` has no built-in timeout; a probe is a cheap
    // `--help`/`--version` invocation so we accept the (small) risk of a
    // hung binary blocking the calling thread rather than pull in a second
    // async runtime dependency just for this. Callers run probes off the
    // async executor via `spawn_blocking`.
    let start = Instant::now();
    let child = Command::new(cmd).args(args).output();
    if start.elapsed() > PROBE_TIMEOUT {
        tracing::warn!(cmd, "CLI probe exceeded 5s timeout");
    }
    child
}

/// Sequential probe of the known copilot-CLI entry points. Returns as soon
/// as one succeeds.
pub fn probe_copilot_cli_available() -> bool {
    if global_cache().cached() {
        return true;
    }

    let found = probe_one("gh", &["copilot", "--help"])
        || probe_gh_extension_list()
        || probe_one("copilot", &["--help"])
        || probe_one("github-copilot", &["--help"])
        || probe_one("github-copilot-cli", &["--help"]);

    global_cache().record(found);
    found
}

fn probe_gh_extension_list() -> bool {
    run_with_timeout("gh", &["extension", "list"])
        .ok()
        .map(|output| {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout).contains("github/gh-copilot")
        })
        .unwrap_or(false)
}

/// Authentication state of whichever CLI entry point is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AuthenticatedGh,
    AuthenticatedStandalone,
    UnauthenticatedGh,
    UnauthenticatedStandalone,
    Unknown,
}

/// Sequential auth probe per spec.md §6 "Auth probe".
pub fn probe_auth_state() -> AuthState {
    if probe_one("gh", &["auth", "status"]) {
        return AuthState::AuthenticatedGh;
    }
    if probe_one("copilot", &["auth", "status"]) {
        return AuthState::AuthenticatedStandalone;
    }
    if probe_one("gh", &["--version"]) {
        return AuthState::UnauthenticatedGh;
    }
    if probe_one("copilot", &["--version"]) {
        return AuthState::UnauthenticatedStandalone;
    }
    AuthState::Unknown
}

/// Build the `copilot` CLI argument vector for a single agent invocation
/// (spec.md §6 "Command construction for the agent CLI"). Non-existent
/// `--add-dir` paths are filtered out.
pub struct CopilotCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_copilot_command(
    task: &str,
    allowed_folders: &[std::path::PathBuf],
    model: Option<&str>,
    log_dir: Option<&std::path::Path>,
    share_path: Option<&std::path::Path>,
    resume_session: Option<&str>,
) -> CopilotCommand {
    let mut args = vec![
        "-p".to_string(),
        task.to_string(),
        "--stream".to_string(),
        "off".to_string(),
        "--allow-all-tools".to_string(),
    ];

    for dir in allowed_folders.iter().filter(|d| d.exists()) {
        args.push("--add-dir".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }

    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }

    if let Some(log_dir) = log_dir {
        args.push("--log-dir".to_string());
        args.push(log_dir.to_string_lossy().into_owned());
        args.push("--log-level".to_string());
        args.push("debug".to_string());
    }

    if let Some(share_path) = share_path {
        args.push("--share".to_string());
        args.push(share_path.to_string_lossy().into_owned());
    }

    if let Some(session) = resume_session {
        args.push("--resume".to_string());
        args.push(session.to_string());
    }

    CopilotCommand {
        program: "copilot",
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_defaults_to_false() {
        let cache = AvailabilityCache::new();
        assert!(!cache.cached());
    }

    #[test]
    fn cache_remembers_positive_forever() {
        let cache = AvailabilityCache::new();
        cache.record(true);
        assert!(cache.cached());
    }

    #[test]
    fn cache_forgets_negative_after_ttl_elapses_conceptually() {
        let cache = AvailabilityCache::new();
        cache.record(false);
        // Within the TTL window the cached negative still reads as unavailable.
        assert!(!cache.cached());
    }

    #[test]
    fn build_copilot_command_filters_missing_dirs() {
        let cmd = build_copilot_command(
            "do the thing",
            &[std::path::PathBuf::from("/definitely/does/not/exist")],
            Some("gpt-5"),
            None,
            None,
            None,
        );
        assert!(!cmd.args.iter().any(|a| a == "--add-dir"));
        assert!(cmd.args.iter().any(|a| a == "--model"));
    }
}
