//! CLI-surface tests: flag parsing and the failure path when required
//! configuration is absent. The happy-path serve/trigger/gc flows are
//! covered at the library level in `broker.rs` — `main` itself is a
//! thin wrapper that this file only needs to smoke-test.

use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn help_lists_the_three_modes() {
    let mut cmd = Command::cargo_bin("fort-daemon").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(contains("--trigger"))
        .stdout(contains("--gc"));
}

#[test]
fn trigger_and_gc_are_mutually_exclusive() {
    let mut cmd = Command::cargo_bin("fort-daemon").unwrap();
    cmd.args(["--trigger", "tokens", "--gc"]);
    cmd.assert().failure();
}

#[test]
fn missing_hosts_json_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("fort-daemon").unwrap();
    cmd.args([
        "--config-dir",
        dir.path().to_str().unwrap(),
        "--state-dir",
        dir.path().to_str().unwrap(),
        "--gc",
    ]);
    cmd.assert().failure();
}
