//! Common test utilities and fixtures
//!
//! Builds throwaway configurations and runs the `gatekeeper` binary.

#![allow(dead_code)]

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use tempfile::TempDir;

/// Get a command for the gatekeeper binary, isolated from the caller's
/// environment overrides
pub fn gatekeeper_cmd() -> Command {
    let mut cmd = Command::cargo_bin("gatekeeper").unwrap();
    for var in ["GATEKEEPER_CONFIG", "GATEKEEPER_URL", "GATEKEEPER_WORKER_ID", "RUST_LOG"] {
        cmd.env_remove(var);
    }
    cmd
}

/// A free local port (bound and released immediately)
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Temporary directory holding a config file, a registry and the data dir
pub struct Workspace {
    pub dir: TempDir,
    pub port: u16,
}

impl Workspace {
    /// Static `tests` gate for commits, memory repository, `docs/**`
    /// owned by alice
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let workspace = Self { dir, port };
        workspace.write_registry(
            r#"
[[resource]]
pattern = "docs/**"
owner = "alice"
description = "documentation"
"#,
        );
        workspace.write_config(&workspace.default_config());
        workspace
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("gatekeeper.toml")
    }

    pub fn config_arg(&self) -> String {
        self.config_path().to_string_lossy().into_owned()
    }

    pub fn registry_path(&self) -> PathBuf {
        self.path().join("registry.toml")
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub fn default_config(&self) -> String {
        format!(
            r#"
[coordinator]
listen_addr = "127.0.0.1:{port}"
url = "ws://127.0.0.1:{port}"
connect_timeout_ms = 2000
request_timeout_ms = 10000
max_reconnect_attempts = 3

[scheduler]
tick_interval_ms = 50

[gates]
default_timeout_ms = 5000
max_attempts = 2

[gates.kinds]
commit = ["tests"]

[gates.checks.tests]
adapter = "static"
outcome = "pass"
delay_ms = 20

[repository]
backend = "memory"

[registry]
path = "{registry}"

[storage]
data_dir = "{data}"
persist = true
fsync = false

[logging]
level = "debug"
"#,
            port = self.port,
            registry = self.registry_path().display(),
            data = self.path().join("data").display(),
        )
    }

    pub fn write_config(&self, content: &str) {
        fs::write(self.config_path(), content).unwrap();
    }

    pub fn write_registry(&self, content: &str) {
        fs::write(self.registry_path(), content).unwrap();
    }

    /// A client command against this workspace's coordinator
    pub fn client(&self, worker: &str) -> Command {
        let mut cmd = gatekeeper_cmd();
        cmd.arg("--config").arg(self.config_arg()).arg("--as").arg(worker);
        cmd.timeout(Duration::from_secs(30));
        cmd
    }

    /// Spawn `gatekeeper serve` and wait until it accepts connections
    pub fn serve(&self) -> Server {
        let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("gatekeeper"))
            .arg("--config")
            .arg(self.config_path())
            .arg("serve")
            .env_remove("RUST_LOG")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let server = Server { child };

        let deadline = Instant::now() + Duration::from_secs(20);
        while TcpStream::connect(("127.0.0.1", self.port)).is_err() {
            assert!(Instant::now() < deadline, "gatekeeper serve did not start listening");
            std::thread::sleep(Duration::from_millis(50));
        }
        server
    }
}

/// Running coordinator; killed on drop
pub struct Server {
    child: Child,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
