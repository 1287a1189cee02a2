//! Exit-code contract of the command surface: 0 success, 2 usage,
//! 3 validation, 4 not-found, 1 unexpected.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    common::init_git_repo(dir.path());
    dir
}

fn quorum() -> Command {
    let mut cmd = Command::cargo_bin("quorum").unwrap();
    cmd.env_remove("QUORUM__MAX_CONCURRENT_WORKFLOWS");
    cmd
}

#[test]
fn no_subcommand_is_a_usage_error() {
    quorum().assert().failure().code(2);
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    quorum().arg("frobnicate").assert().failure().code(2);
}

#[test]
fn help_succeeds_and_names_the_pipeline_commands() {
    quorum()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("pause"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("workflow"));
}

#[test]
fn empty_prompt_fails_validation() {
    let dir = repo();
    quorum()
        .current_dir(dir.path())
        .args(["run", "   "])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn status_of_unknown_workflow_is_not_found() {
    let dir = repo();
    quorum()
        .current_dir(dir.path())
        .args(["status", "wf-20260101000000-zzzzzz"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn malformed_workflow_id_fails_validation() {
    let dir = repo();
    quorum()
        .current_dir(dir.path())
        .args(["cancel", "not-an-id"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn list_in_fresh_repo_succeeds() {
    let dir = repo();
    quorum()
        .current_dir(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("no workflows"));
}

#[test]
fn outside_a_git_repository_is_unexpected() {
    let dir = TempDir::new().unwrap();
    quorum()
        .current_dir(dir.path())
        .arg("list")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("git repository"));
}

#[test]
fn pause_of_unknown_workflow_is_not_found() {
    let dir = repo();
    // No orchestrator process is running this workflow.
    quorum()
        .current_dir(dir.path())
        .args(["pause", "wf-20260101000000-zzzzzz"])
        .assert()
        .failure()
        .code(4);
}
