//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides
//! through the `config` subcommands

use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gatekeeper.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    /// `gatekeeper --config <file> config <subcommand>`
    fn command(&self, subcommand: &str) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("gatekeeper").unwrap();
        for var in ["GATEKEEPER_URL", "GATEKEEPER_CONFLICT_POLICY", "GATEKEEPER_MAX_ATTEMPTS", "GATEKEEPER_LOG_LEVEL"] {
            cmd.env_remove(var);
        }
        cmd.arg("--config").arg(self.path()).arg("config").arg(subcommand);
        cmd
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "wss://gatekeeper.example.com"
"#,
    );

    fixture.command("validate").assert().success();
}

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    fixture
        .command("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("ws://127.0.0.1:7420"))
        .stdout(predicate::str::contains("conflict_policy = \"race\""));
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
listen_addr = "0.0.0.0:9100"
url = "ws://gatekeeper.internal:9100"
worker_id = "w1"
connect_timeout_ms = 1000
request_timeout_ms = 5000
max_reconnect_attempts = 2

[mailbox]
dedup_window_secs = 60
capacity = 16

[validation]
timeout_ms = 2000
max_target_paths = 10
max_path_len = 200
max_description_len = 1000
conflict_policy = "reject_early"

[scheduler]
dependency_timeout_secs = 120
tick_interval_ms = 100

[gates]
default_timeout_ms = 30000
max_concurrent = 2
fail_fast = false
max_attempts = 5

[gates.kinds]
commit = ["tests", "coverage"]
merge = ["tests"]

[gates.checks.tests]
adapter = "command"
program = "make"
args = ["test"]
timeout_ms = 60000

[gates.checks.coverage]
adapter = "coverage"
program = "make"
args = ["coverage"]
threshold = 75.0

[repository]
backend = "git"
path = "/srv/repo"
main_branch = "trunk"

[registry]
path = "/etc/gatekeeper/registry.toml"

[storage]
data_dir = "/var/lib/gatekeeper"
persist = true
fsync = false

[logging]
level = "debug"
file = "/var/log/gatekeeper/gatekeeper.log"
max_files = 3
json_format = true
"#,
    );

    fixture.command("validate").assert().success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_coordinator_url() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "http://not-websocket.com"
"#,
    );

    fixture
        .command("validate")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("ws://"));
}

#[test]
fn test_invalid_listen_addr() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
listen_addr = "not-an-address"
"#,
    );

    fixture.command("validate").assert().failure();
}

#[test]
fn test_undefined_check_in_kind_plan() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[gates.kinds]
commit = ["tests"]

[gates.checks.lint]
adapter = "static"
"#,
    );

    fixture
        .command("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("'tests' is not defined"));
}

#[test]
fn test_unknown_request_kind_in_plan() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[gates.kinds]
rebase = ["tests"]

[gates.checks.tests]
adapter = "static"
"#,
    );

    fixture.command("validate").assert().failure();
}

#[test]
fn test_coverage_requires_threshold() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[gates.kinds]
commit = ["coverage"]

[gates.checks.coverage]
adapter = "coverage"
program = "make"
"#,
    );

    fixture
        .command("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("threshold"));
}

#[test]
fn test_zero_max_attempts() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[gates]
max_attempts = 0
"#,
    );

    fixture.command("validate").assert().failure();
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "invalid_level"
"#,
    );

    fixture.command("validate").assert().failure();
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator
url = "wss://example.com"
"#,
    );

    fixture
        .command("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("parse"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_overrides_file() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "ws://from-file:7420"

[gates]
max_attempts = 3
"#,
    );

    fixture
        .command("show")
        .env("GATEKEEPER_URL", "ws://from-env:9000")
        .env("GATEKEEPER_MAX_ATTEMPTS", "7")
        .env("GATEKEEPER_CONFLICT_POLICY", "reject-early")
        .assert()
        .success()
        .stdout(predicate::str::contains("ws://from-env:9000"))
        .stdout(predicate::str::contains("max_attempts = 7"))
        .stdout(predicate::str::contains("conflict_policy = \"reject_early\""));
}

#[test]
fn test_invalid_env_value_fails_validation() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    fixture
        .command("validate")
        .env("GATEKEEPER_URL", "http://wrong-scheme")
        .assert()
        .failure();
}
