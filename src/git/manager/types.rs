//! Git types and parsing helpers

use crate::domain::NodeId;

/// Result of creating (or reusing) a node's worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Path to the worktree.
    pub path: std::path::PathBuf,
    /// The commitish the worktree's detached HEAD was resolved from.
    pub base_commit: String,
    /// Whether an existing worktree directory was reused rather than created.
    pub reused: bool,
}

/// Suggested git commit message (subject + optional body).
#[derive(Debug, Clone)]
pub struct CommitMessage {
    pub subject: String,
    pub body: Option<String>,
}

impl CommitMessage {
    /// Build a commit message for a node's `commit` phase from its task
    /// description and id, falling back to a generic subject if the task is
    /// empty after sanitizing.
    pub fn for_node(task: &str, node_id: NodeId) -> Self {
        let subject = sanitize_commit_subject(task);
        let body = Some(format!("railyard-node: {}", node_id));
        Self { subject, body }
    }

    pub fn auto_commit_before_merge() -> Self {
        Self {
            subject: "Auto-commit remaining changes before merge".to_string(),
            body: None,
        }
    }
}

fn sanitize_commit_subject(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or("").trim();
    let mut out: String = first_line
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    if out.is_empty() {
        out = "railyard: update".to_string();
    }

    const MAX_LEN: usize = 72;
    if out.chars().count() > MAX_LEN {
        out = out.chars().take(MAX_LEN).collect();
    }

    out
}

/// Status of a file in a diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed { from: String },
    Copied { from: String },
    Untracked,
}

/// Diff information for a single file
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: String,
    pub status: FileStatus,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub is_binary: bool,
    pub patch: Option<String>,
}

/// Aggregated diff report
#[derive(Debug, Clone)]
pub struct DiffReport {
    pub files: Vec<FileDiff>,
    pub total_added: usize,
    pub total_removed: usize,
    pub files_changed: usize,
}

/// Options for diff generation
#[derive(Debug, Clone, Default)]
pub struct DiffSettings {
    pub ignore_whitespace: bool,
    pub context_lines: u32,
    pub include_untracked: bool,
}

/// Parse NUL-delimited output from git commands
pub(super) fn parse_null_delimited(output: &[u8]) -> Vec<String> {
    output
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .filter_map(|s| std::str::from_utf8(s).ok())
        .map(|s| s.to_string())
        .collect()
}

/// Parse git diff --numstat -z output
/// Returns tuples of (path, lines_added, lines_removed, is_binary)
pub(super) fn parse_numstat_output(output: &[u8]) -> Vec<(String, usize, usize, bool)> {
    let text = String::from_utf8_lossy(output);
    let mut results = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            continue;
        }

        let (added, removed, is_binary) = if parts[0] == "-" && parts[1] == "-" {
            (0, 0, true)
        } else {
            let added = parts[0].parse().unwrap_or(0);
            let removed = parts[1].parse().unwrap_or(0);
            (added, removed, false)
        };

        let path = parts[2].to_string();

        if !path.is_empty() {
            results.push((path, added, removed, is_binary));
        }
    }

    results
}
