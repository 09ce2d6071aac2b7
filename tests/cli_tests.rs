//! CLI integration tests using assert_cmd.
//!
//! Nothing here needs a coordinator: the local tools (`test`, `selftest`,
//! `login`) and argument validation. Every test that touches config passes
//! `--config` into a temp dir.

use assert_cmd::Command;
use predicates::prelude::*;

#[allow(deprecated)]
fn client() -> Command {
    let mut cmd = Command::cargo_bin("mersenne-client").unwrap();
    cmd.env_remove("MERSENNE_USERNAME")
        .env_remove("MERSENNE_SERVER")
        .env("RUST_LOG", "warn");
    cmd
}

// ── Help and Argument Validation ────────────────────────────────

#[test]
fn help_shows_all_subcommands() {
    client().arg("--help").assert().success().stdout(
        predicate::str::contains("run")
            .and(predicate::str::contains("dashboard"))
            .and(predicate::str::contains("selftest"))
            .and(predicate::str::contains("test"))
            .and(predicate::str::contains("login")),
    );
}

#[test]
fn help_lists_worker_options() {
    client().arg("--help").assert().success().stdout(
        predicate::str::contains("--server")
            .and(predicate::str::contains("--slots"))
            .and(predicate::str::contains("--mode"))
            .and(predicate::str::contains("--max-errors")),
    );
}

#[test]
fn unknown_mode_rejected() {
    client()
        .args(["--mode", "turbo", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("turbo"));
}

#[test]
fn missing_subcommand_fails() {
    client().assert().failure();
}

// ── Local Lucas-Lehmer Test ─────────────────────────────────────

#[test]
fn test_reports_known_prime() {
    client()
        .args(["test", "127"])
        .assert()
        .success()
        .stdout(predicate::str::contains("M127 is prime"));
}

#[test]
fn test_reports_known_composite() {
    client()
        .args(["test", "23"])
        .assert()
        .success()
        .stdout(predicate::str::contains("M23 is composite"));
}

#[test]
fn test_short_circuits_composite_exponent() {
    client()
        .args(["test", "15"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exponent is not prime"));
}

#[test]
fn test_pipelined_agrees() {
    client()
        .args(["test", "521", "--units", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("M521 is prime"));
}

#[test]
fn test_rejects_exponent_two() {
    client().args(["test", "2"]).assert().failure();
}

// ── Self Test ───────────────────────────────────────────────────

#[test]
fn selftest_passes() {
    client()
        .args(["selftest", "--units", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("passed"));
}

#[test]
fn selftest_rejects_zero_units() {
    client()
        .args(["selftest", "--units", "0"])
        .assert()
        .failure();
}

// ── Login and Config ────────────────────────────────────────────

#[test]
fn login_saves_username() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    client()
        .arg("--config")
        .arg(&path)
        .args(["login", "--username", "alice_01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Logged in as alice_01"));

    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains("alice_01"), "{}", saved);
}

#[test]
fn login_rejects_invalid_username() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    client()
        .arg("--config")
        .arg(&path)
        .args(["login", "--username", "no spaces!"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("username"));
    assert!(!path.exists());
}

#[test]
fn run_without_username_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    client()
        .arg("--config")
        .arg(&path)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No username configured"));
}

#[test]
fn run_rejects_zero_slots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    client()
        .arg("--config")
        .arg(&path)
        .args(["--username", "alice", "--slots", "0", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--slots"));
}
