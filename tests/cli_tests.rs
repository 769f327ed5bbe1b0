//! CLI integration tests for the `engyne` binary.
//!
//! These tests exercise the command-line interface using `assert_cmd`, which
//! spawns the compiled binary as a subprocess and asserts on exit code,
//! stdout, and stderr. All tests here are argument-validation/help tests —
//! no slot filesystem or network access required.

use assert_cmd::Command;
use predicates::prelude::*;

#[allow(deprecated)]
fn engyne() -> Command {
    Command::cargo_bin("engyne").unwrap()
}

#[test]
fn help_shows_all_roles() {
    engyne().arg("--help").assert().success().stdout(
        predicate::str::contains("supervisor")
            .and(predicate::str::contains("worker"))
            .and(predicate::str::contains("dispatcher"))
            .and(predicate::str::contains("sink")),
    );
}

#[test]
fn worker_requires_all_positional_args() {
    engyne()
        .arg("worker")
        .arg("./slots")
        .arg("s1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn dispatcher_requires_channel() {
    engyne()
        .arg("dispatcher")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn supervisor_requires_slots_root() {
    engyne()
        .arg("supervisor")
        .assert()
        .failure()
        .stderr(predicate::str::contains("slots-root").or(predicate::str::contains("required")));
}

#[test]
fn unknown_subcommand_is_rejected() {
    engyne()
        .arg("not-a-real-role")
        .assert()
        .failure();
}
