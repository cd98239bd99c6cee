//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

mod common;

use predicates::prelude::*;
use tempfile::TempDir;

use common::{gatekeeper_cmd, Workspace};

// ─────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    gatekeeper_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Commit Gatekeeper"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    gatekeeper_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("commit-gatekeeper"))
        .stdout(predicate::str::contains("Build Information"))
        .stdout(predicate::str::contains("Git Hash"))
        .stdout(predicate::str::contains("Protocol"));
}

#[test]
fn test_short_version_flag() {
    gatekeeper_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("gatekeeper"));
}

#[test]
fn test_submit_help() {
    gatekeeper_cmd()
        .args(["submit", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--depends-on"))
        .stdout(predicate::str::contains("--approval"))
        .stdout(predicate::str::contains("--wait"));
}

// ─────────────────────────────────────────────────────────────────
// Config Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_explicit_file() {
    let workspace = Workspace::new();
    gatekeeper_cmd()
        .args(["--config", &workspace.config_arg(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[coordinator]"))
        .stdout(predicate::str::contains("[mailbox]"))
        .stdout(predicate::str::contains("[gates.checks.tests]"))
        .stdout(predicate::str::contains("[storage]"))
        .stdout(predicate::str::contains(workspace.url()));
}

#[test]
fn test_config_validate_explicit_file() {
    let workspace = Workspace::new();
    gatekeeper_cmd()
        .args(["--config", &workspace.config_arg(), "config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_nonexistent_file() {
    gatekeeper_cmd()
        .args(["--config", "/nonexistent/path/gatekeeper.toml", "config", "validate"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_config_init_writes_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("gatekeeper.toml");
    let path_arg = path.to_string_lossy().into_owned();

    gatekeeper_cmd()
        .args(["config", "init", "--path", &path_arg])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));
    assert!(path.exists());

    // The generated file is itself valid
    gatekeeper_cmd()
        .args(["--config", &path_arg, "config", "validate"])
        .assert()
        .success();

    // A second init refuses to overwrite
    gatekeeper_cmd()
        .args(["config", "init", "--path", &path_arg])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    gatekeeper_cmd()
        .args(["config", "init", "--path", &path_arg, "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_init_help() {
    gatekeeper_cmd()
        .args(["config", "init", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialize"))
        .stdout(predicate::str::contains("--path"))
        .stdout(predicate::str::contains("--force"));
}

// ─────────────────────────────────────────────────────────────────
// Registry Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_registry_show() {
    let workspace = Workspace::new();
    gatekeeper_cmd()
        .args(["--config", &workspace.config_arg(), "registry", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("docs/**"))
        .stdout(predicate::str::contains("alice"));
}

#[test]
fn test_registry_show_rejects_bad_pattern() {
    let workspace = Workspace::new();
    workspace.write_registry(
        r#"
[[resource]]
pattern = "src/[unclosed"
owner = "alice"
"#,
    );
    gatekeeper_cmd()
        .args(["--config", &workspace.config_arg(), "registry", "show"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────
// Client Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_status_without_coordinator() {
    let workspace = Workspace::new();
    workspace.client("bob")
        .args(["status", "1"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("E30"));
}

// ─────────────────────────────────────────────────────────────────
// Verbosity Flag Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_verbose_flag() {
    gatekeeper_cmd().args(["-v", "version"]).assert().success();
}

#[test]
fn test_very_verbose_flag() {
    gatekeeper_cmd().args(["-vv", "version"]).assert().success();
}

#[test]
fn test_quiet_flag() {
    gatekeeper_cmd().args(["--quiet", "version"]).assert().success();
}

// ─────────────────────────────────────────────────────────────────
// Error Handling Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_command() {
    gatekeeper_cmd()
        .arg("unknown-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_unknown_request_kind() {
    gatekeeper_cmd()
        .args(["submit", "rebase", "a.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown request kind"));
}

#[test]
fn test_missing_subcommand() {
    gatekeeper_cmd().assert().failure();
}
