//! Integration tests for `cadence run` and `cadence resume` against scripted
//! model responses.


use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use fixtures::{COMPLETE, turn, turn_with_usage, write_file_turn, write_script};
use predicates::prelude::*;
use tempfile::tempdir;

/// Runs a task in `root` with `CADENCE_HOME` set to `home`.
fn cadence(home: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("cadence");
    cmd.env("CADENCE_HOME", home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_run_writes_file_and_completes() {
    let home = tempdir().unwrap();
    let root = tempdir().unwrap();
    let script = write_script(
        home.path(),
        "turns.json",
        &[
            write_file_turn("hello.txt", "hi there"),
            turn_with_usage(COMPLETE, 1000, 200),
        ],
    );

    cadence(home.path())
        .args(["run", "--task", "create hello.txt", "--yes", "--script"])
        .arg(&script)
        .arg("--root")
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Task: create hello.txt"))
        .stdout(predicate::str::contains("Creating the file."))
        .stdout(predicate::str::contains("[ask:tool]"))
        .stdout(predicate::str::contains("Result: Done."))
        .stderr(predicate::str::contains("completed"))
        .stderr(predicate::str::contains("1000 in, 200 out"));

    let written = fs::read_to_string(root.path().join("hello.txt")).unwrap();
    assert!(written.contains("hi there"));
}

#[test]
fn test_run_answers_from_stdin() {
    let home = tempdir().unwrap();
    let root = tempdir().unwrap();
    let script = write_script(
        home.path(),
        "turns.json",
        &[write_file_turn("hello.txt", "hi"), turn(COMPLETE)],
    );

    // Decline the write, then accept the result.
    cadence(home.path())
        .args(["run", "--task", "create hello.txt", "--script"])
        .arg(&script)
        .arg("--root")
        .arg(root.path())
        .write_stdin("n\ny\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Result: Done."));

    assert!(!root.path().join("hello.txt").exists());
}

#[test]
fn test_run_auto_approve_skips_edit_ask() {
    let home = tempdir().unwrap();
    let root = tempdir().unwrap();
    let script = write_script(
        home.path(),
        "turns.json",
        &[write_file_turn("notes.md", "# Notes"), turn(COMPLETE)],
    );

    // Only the completion ask is left to answer.
    cadence(home.path())
        .args(["run", "--task", "take notes", "--auto-approve", "--script"])
        .arg(&script)
        .arg("--root")
        .arg(root.path())
        .write_stdin("y\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("[ask:tool]").not())
        .stdout(predicate::str::contains("[say:tool]"));

    assert!(root.path().join("notes.md").exists());
}

#[test]
fn test_run_fails_when_script_runs_out() {
    let home = tempdir().unwrap();
    let root = tempdir().unwrap();
    let script = write_script(home.path(), "turns.json", &[]);

    cadence(home.path())
        .args(["run", "--task", "anything", "--yes", "--script"])
        .arg(&script)
        .arg("--root")
        .arg(root.path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("[ask:api_req_failed]"))
        .stderr(predicate::str::contains("failed"));
}

#[test]
fn test_run_with_missing_script() {
    let home = tempdir().unwrap();

    cadence(home.path())
        .args(["run", "--task", "anything", "--script", "missing.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("missing.json"));
}

#[test]
fn test_resume_completed_task() {
    let home = tempdir().unwrap();
    let root = tempdir().unwrap();
    let first = write_script(home.path(), "first.json", &[turn(COMPLETE)]);
    let second = write_script(home.path(), "second.json", &[turn(COMPLETE)]);

    cadence(home.path())
        .args(["run", "--task", "first pass", "--yes", "--script"])
        .arg(&first)
        .arg("--root")
        .arg(root.path())
        .assert()
        .success();

    let listing = cadence(home.path())
        .args(["tasks", "list"])
        .output()
        .unwrap();
    let stdout = String::from_utf8(listing.stdout).unwrap();
    let id = stdout.split_whitespace().next().unwrap().to_string();

    cadence(home.path())
        .args(["resume", &id, "--yes", "--script"])
        .arg(&second)
        .arg("--root")
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("[ask:resume_completed_task]"))
        .stdout(predicate::str::contains("Result: Done."));

    cadence(home.path())
        .args(["tasks", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task: first pass"));
}

#[test]
fn test_resume_unknown_task() {
    let home = tempdir().unwrap();
    let script = write_script(home.path(), "turns.json", &[]);

    cadence(home.path())
        .args(["resume", "nope", "--script"])
        .arg(&script)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no saved task with id 'nope'"));
}
