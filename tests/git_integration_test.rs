//! Integration tests for worktree lifecycle, FI merges, commits, RI merges,
//! and diff reporting against a real `git` binary.

mod common;

use std::fs;
use std::path::Path;
use std::process::Command;

use railyard::git::{CommitMessage, DiffSettings, FileStatus, GitManager};
use uuid::Uuid;

use common::create_test_repo;

#[test]
fn test_git_manager_creation() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");

    let sha = manager.head_sha().expect("Failed to get HEAD sha");
    assert!(!sha.is_empty(), "HEAD sha should not be empty");
}

#[test]
fn test_worktree_creation_and_removal() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let node_id = Uuid::new_v4();
    let base = manager.head_sha().expect("head sha");

    let info = manager
        .create_or_reuse_detached(&worktree_root, node_id, &base)
        .expect("Failed to create worktree");

    assert!(info.path.exists(), "Worktree directory should exist");
    assert!(!info.reused, "Freshly created worktree should not be reused");
    assert!(
        info.path.join("test.txt").exists(),
        "test.txt should exist in worktree"
    );

    let content = fs::read_to_string(info.path.join("test.txt")).expect("Failed to read file");
    assert_eq!(content, "initial content\n");

    manager
        .remove_worktree_safe(&info.path, false)
        .expect("Failed to remove worktree");
    assert!(!info.path.exists(), "Worktree directory should be removed");
}

#[test]
fn test_worktree_reuse_after_crash() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let node_id = Uuid::new_v4();
    let base = manager.head_sha().expect("head sha");

    let first = manager
        .create_or_reuse_detached(&worktree_root, node_id, &base)
        .expect("Failed to create worktree");

    let second = manager
        .create_or_reuse_detached(&worktree_root, node_id, &base)
        .expect("Failed to reuse worktree");

    assert_eq!(first.path, second.path);
    assert!(second.reused, "Second call for the same node should reuse the worktree");

    manager.remove_worktree_safe(&first.path, false).expect("cleanup");
}

#[test]
fn test_changed_files_and_diff_report() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let node_id = Uuid::new_v4();
    let base = manager.head_sha().expect("head sha");

    let info = manager
        .create_or_reuse_detached(&worktree_root, node_id, &base)
        .expect("Failed to create worktree");

    fs::write(info.path.join("test.txt"), "modified content\n").expect("Failed to modify file");
    fs::write(info.path.join("new_file.txt"), "new file content\n").expect("Failed to add file");

    let changed = manager.changed_files(&info.path).expect("Failed to get changed files");
    assert!(changed.contains(&Path::new("test.txt").to_path_buf()));
    assert!(changed.contains(&Path::new("new_file.txt").to_path_buf()));

    let settings = DiffSettings {
        include_untracked: true,
        ..Default::default()
    };
    let report = manager
        .diff_report(&info.path, None, &settings)
        .expect("Failed to get diff report");
    assert_eq!(report.files_changed, 2);
    let new_file = report
        .files
        .iter()
        .find(|f| f.path == "new_file.txt")
        .expect("new_file.txt should be in the report");
    assert_eq!(new_file.status, FileStatus::Untracked);

    manager.remove_worktree_safe(&info.path, false).expect("cleanup");
}

#[test]
fn test_commit_worktree_changes_and_merge_fi() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let base = manager.head_sha().expect("head sha");

    let producer = manager
        .create_or_reuse_detached(&worktree_root, Uuid::new_v4(), &base)
        .expect("producer worktree");
    fs::write(producer.path.join("from_producer.txt"), "producer output\n").expect("write");
    let commit = manager
        .commit_worktree_changes(
            &producer.path,
            &CommitMessage {
                subject: "producer work".to_string(),
                body: None,
            },
        )
        .expect("commit worktree changes")
        .expect("a commit should have been created");

    let consumer = manager
        .create_or_reuse_detached(&worktree_root, Uuid::new_v4(), &base)
        .expect("consumer worktree");
    manager
        .merge_commit_into_worktree(&consumer.path, &commit)
        .expect("merge-fi should apply the producer's commit");
    assert!(
        consumer.path.join("from_producer.txt").exists(),
        "consumer worktree should contain the producer's file after merge-fi"
    );

    manager.remove_worktree_safe(&producer.path, false).expect("cleanup");
    manager.remove_worktree_safe(&consumer.path, false).expect("cleanup");
}

#[test]
fn test_commit_worktree_changes_returns_none_when_nothing_to_commit() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let base = manager.head_sha().expect("head sha");

    let info = manager
        .create_or_reuse_detached(&worktree_root, Uuid::new_v4(), &base)
        .expect("worktree");

    let commit = manager
        .commit_worktree_changes(&info.path, &CommitMessage::auto_commit_before_merge())
        .expect("commit attempt should not fail");
    assert!(commit.is_none(), "nothing to commit should return None");

    manager.remove_worktree_safe(&info.path, false).expect("cleanup");
}

#[test]
fn test_merge_commit_into_branch_reverse_integration() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let base = manager.head_sha().expect("head sha");
    let target_branch = manager.current_branch().expect("current branch");

    let info = manager
        .create_or_reuse_detached(&worktree_root, Uuid::new_v4(), &base)
        .expect("worktree");
    fs::write(info.path.join("ri_file.txt"), "reverse integrated\n").expect("write");
    let commit = manager
        .commit_worktree_changes(
            &info.path,
            &CommitMessage {
                subject: "work to merge back".to_string(),
                body: None,
            },
        )
        .expect("commit")
        .expect("a commit should exist");

    manager
        .merge_commit_into_branch(&target_branch, &commit)
        .expect("RI merge should succeed");

    assert!(
        temp_dir.path().join("ri_file.txt").exists(),
        "the merged file should now exist in the main repo"
    );

    manager.remove_worktree_safe(&info.path, false).expect("cleanup");
}

#[test]
fn test_reset_hard_and_clean_restore_worktree_to_base() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let worktree_root = temp_dir.path().join("worktrees");
    let base = manager.head_sha().expect("head sha");

    let info = manager
        .create_or_reuse_detached(&worktree_root, Uuid::new_v4(), &base)
        .expect("worktree");
    fs::write(info.path.join("test.txt"), "scratch work\n").expect("write");
    fs::write(info.path.join("untracked.txt"), "scratch\n").expect("write");

    manager.reset_hard(&info.path, &base).expect("reset_hard");
    manager.clean(&info.path).expect("clean");

    let content = fs::read_to_string(info.path.join("test.txt")).expect("read test.txt");
    assert_eq!(content, "initial content\n");
    assert!(!info.path.join("untracked.txt").exists());

    manager.remove_worktree_safe(&info.path, false).expect("cleanup");
}

#[test]
fn test_has_uncommitted_changes() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");

    assert!(!manager.has_uncommitted_changes().expect("check"));

    fs::write(temp_dir.path().join("test.txt"), "changed\n").expect("modify");
    assert!(manager.has_uncommitted_changes().expect("check"));
}

#[test]
fn test_fetch_is_a_noop_without_a_remote() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");

    manager.fetch().expect("fetch should not fail on a repo with no remote");
}

#[test]
fn test_update_ref_with_retry_moves_branch_tip() {
    let temp_dir = create_test_repo();
    let manager = GitManager::new(temp_dir.path()).expect("Failed to create GitManager");
    let branch = manager.current_branch().expect("current branch");

    fs::write(temp_dir.path().join("test.txt"), "second commit\n").expect("write");
    Command::new("git")
        .args(["commit", "-am", "second commit"])
        .current_dir(temp_dir.path())
        .output()
        .expect("commit");
    let new_head = manager.head_sha().expect("head sha");

    // update-ref to the same branch's new tip is a no-op in terms of content
    // but exercises the retry-on-lock-contention path end to end.
    manager.update_ref_with_retry(&branch, &new_head).expect("update-ref");
    assert_eq!(manager.head_sha().expect("head sha"), new_head);
}
