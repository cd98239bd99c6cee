//! Configuration system for the commit gatekeeper
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (GATEKEEPER_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::RequestKind;

/// Main gatekeeper configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Coordinator endpoint settings
    pub coordinator: CoordinatorSettings,

    /// Request mailbox settings
    pub mailbox: MailboxSettings,

    /// Admission rules
    pub validation: ValidationSettings,

    /// Dependency scheduler settings
    pub scheduler: SchedulerSettings,

    /// Quality gates
    pub gates: GateSettings,

    /// Shared repository
    pub repository: RepositorySettings,

    /// Protected-resource registry
    pub registry: RegistrySettings,

    /// Data storage paths
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Coordinator endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Address `serve` listens on
    pub listen_addr: String,

    /// URL client commands connect to
    pub url: String,

    /// Worker id used by client commands (defaults to the hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Time to wait for a reply in milliseconds
    pub request_timeout_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
}

/// Request mailbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxSettings {
    /// Window within which an identical resubmission is a duplicate
    pub dedup_window_secs: u64,

    /// Maximum queued requests awaiting validation
    pub capacity: usize,
}

/// How overlapping requests without a declared dependency are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Both proceed; the write critical section decides
    #[default]
    Race,
    /// Reject at validation when an in-flight request from another
    /// submitter targets an overlapping path
    RejectEarly,
}

/// Admission rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Time allowed for admission (mailbox + validation) in milliseconds
    pub timeout_ms: u64,

    /// Maximum number of target paths per request
    pub max_target_paths: usize,

    /// Maximum length of one target path
    pub max_path_len: usize,

    /// Maximum payload description length
    pub max_description_len: usize,

    pub conflict_policy: ConflictPolicy,
}

/// Dependency scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Longest a request may wait on its dependencies
    pub dependency_timeout_secs: u64,

    /// Interval of the timeout sweep in milliseconds
    pub tick_interval_ms: u64,
}

/// Check adapter type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckAdapter {
    /// External program; passes on exit status 0
    #[default]
    Command,
    /// External program printing a coverage percentage
    Coverage,
    /// Fixed outcome (dry runs and tests)
    Static,
}

/// Outcome of a static check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticOutcome {
    #[default]
    Pass,
    Fail,
    /// Never finishes; only the timeout ends it
    Hang,
}

/// One named quality check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSettings {
    pub adapter: CheckAdapter,

    /// Program to run (command, coverage)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,

    pub args: Vec<String>,

    /// Working directory; relative paths resolve against the checkout the
    /// check runs in (the attempt's worktree with the git backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Extra environment variables
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Per-check timeout (defaults to gates.default_timeout_ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Minimum coverage percentage (coverage)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,

    /// Fixed outcome (static)
    pub outcome: StaticOutcome,

    /// Simulated run time (static)
    pub delay_ms: u64,
}

/// Quality gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Timeout for checks without their own
    pub default_timeout_ms: u64,

    /// Gate runs in parallel (0 = number of CPUs)
    pub max_concurrent: usize,

    /// Skip the remaining checks after the first failure
    pub fail_fast: bool,

    /// Attempts per request before it is force-failed
    pub max_attempts: u32,

    /// Ordered check list per request kind
    pub kinds: BTreeMap<String, Vec<String>>,

    /// Check definitions by name
    pub checks: BTreeMap<String, CheckSettings>,
}

/// Repository backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryBackend {
    /// In-process repository model
    #[default]
    Memory,
    /// A git working tree
    Git,
}

/// Shared repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    pub backend: RepositoryBackend,

    /// Working tree (git backend, and default check working directory)
    pub path: String,

    pub main_branch: String,

    /// Commit author identity
    pub author_name: String,
    pub author_email: String,
}

/// Protected-resource registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Mapping file
    pub path: String,
}

/// Storage path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory (requests, ledger, approvals, memory repository)
    pub data_dir: String,

    /// Persist state to `data_dir` (false keeps everything in memory)
    pub persist: bool,

    /// fsync every appended record
    pub fsync: bool,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// ─────────────────────────────────────────────────────────────────
// Default Implementations
// ─────────────────────────────────────────────────────────────────

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7420".to_string(),
            url: "ws://127.0.0.1:7420".to_string(),
            worker_id: None,
            connect_timeout_ms: 5000,
            request_timeout_ms: 30000,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            capacity: 1024,
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10000,
            max_target_paths: 256,
            max_path_len: 1024,
            max_description_len: 16384,
            conflict_policy: ConflictPolicy::Race,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            dependency_timeout_secs: 3600,
            tick_interval_ms: 1000,
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        let mut kinds = BTreeMap::new();
        kinds.insert("commit".to_string(), vec!["tests".to_string(), "lint".to_string()]);
        kinds.insert("merge".to_string(), vec!["tests".to_string()]);

        let mut checks = BTreeMap::new();
        checks.insert(
            "tests".to_string(),
            CheckSettings {
                adapter: CheckAdapter::Command,
                program: Some("cargo".to_string()),
                args: vec!["test".to_string(), "--quiet".to_string()],
                ..Default::default()
            },
        );
        checks.insert(
            "lint".to_string(),
            CheckSettings {
                adapter: CheckAdapter::Command,
                program: Some("cargo".to_string()),
                args: vec!["clippy".into(), "--quiet".into(), "--".into(), "-D".into(), "warnings".into()],
                ..Default::default()
            },
        );

        Self {
            default_timeout_ms: 600_000,
            max_concurrent: 0,
            fail_fast: true,
            max_attempts: 3,
            kinds,
            checks,
        }
    }
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            backend: RepositoryBackend::Memory,
            path: ".".to_string(),
            main_branch: "main".to_string(),
            author_name: "Commit Gatekeeper".to_string(),
            author_email: "gatekeeper@localhost".to_string(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: "~/.gatekeeper/registry.toml".to_string(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.gatekeeper".to_string(),
            persist: true,
            fsync: true,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────

impl GatekeeperConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::parse_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    pub fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("gatekeeper.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("gatekeeper").join("gatekeeper.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".gatekeeper").join("gatekeeper.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/gatekeeper/gatekeeper.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Coordinator settings
        if let Ok(val) = std::env::var("GATEKEEPER_LISTEN_ADDR") {
            self.coordinator.listen_addr = val;
        }
        if let Ok(val) = std::env::var("GATEKEEPER_URL") {
            self.coordinator.url = val;
        }
        if let Ok(val) = std::env::var("GATEKEEPER_WORKER_ID") {
            self.coordinator.worker_id = Some(val);
        }

        // Admission
        if let Ok(val) = std::env::var("GATEKEEPER_DEDUP_WINDOW_SECS") {
            if let Ok(n) = val.parse() {
                self.mailbox.dedup_window_secs = n;
            }
        }
        if let Ok(val) = std::env::var("GATEKEEPER_CONFLICT_POLICY") {
            match val.to_lowercase().replace('-', "_").as_str() {
                "race" => self.validation.conflict_policy = ConflictPolicy::Race,
                "reject_early" => self.validation.conflict_policy = ConflictPolicy::RejectEarly,
                _ => {}
            }
        }

        // Gates
        if let Ok(val) = std::env::var("GATEKEEPER_MAX_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.gates.max_attempts = n;
            }
        }
        if let Ok(val) = std::env::var("GATEKEEPER_MAX_CONCURRENT") {
            if let Ok(n) = val.parse() {
                self.gates.max_concurrent = n;
            }
        }

        // Repository and registry
        if let Ok(val) = std::env::var("GATEKEEPER_REPOSITORY_BACKEND") {
            match val.to_lowercase().as_str() {
                "memory" => self.repository.backend = RepositoryBackend::Memory,
                "git" => self.repository.backend = RepositoryBackend::Git,
                _ => {}
            }
        }
        if let Ok(val) = std::env::var("GATEKEEPER_REPOSITORY_PATH") {
            self.repository.path = val;
        }
        if let Ok(val) = std::env::var("GATEKEEPER_REGISTRY") {
            self.registry.path = val;
        }

        // Storage settings
        if let Ok(val) = std::env::var("GATEKEEPER_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("GATEKEEPER_FSYNC") {
            self.storage.fsync = val.to_lowercase() == "true" || val == "1";
        }

        // Logging settings
        if let Ok(val) = std::env::var("GATEKEEPER_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("GATEKEEPER_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("GATEKEEPER_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);
        self.registry.path = expand_path(&self.registry.path);
        self.repository.path = expand_path(&self.repository.path);
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
        for check in self.gates.checks.values_mut() {
            if let Some(ref dir) = check.workdir {
                check.workdir = Some(expand_path(dir));
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Coordinator endpoint
        if !self.coordinator.url.starts_with("ws://") && !self.coordinator.url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "coordinator.url",
                "Coordinator URL must start with ws:// or wss://",
            ));
        }
        if self.coordinator.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(Error::config_field_invalid(
                "coordinator.listen_addr",
                format!("'{}' is not a socket address", self.coordinator.listen_addr),
            ));
        }

        // Admission
        if self.mailbox.capacity == 0 {
            return Err(Error::config_field_invalid("mailbox.capacity", "must be at least 1"));
        }
        if self.validation.max_target_paths == 0 || self.validation.max_path_len == 0 {
            return Err(Error::config_field_invalid(
                "validation",
                "max_target_paths and max_path_len must be at least 1",
            ));
        }
        if self.validation.timeout_ms == 0 {
            return Err(Error::config_field_invalid("validation.timeout_ms", "must be at least 1"));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(Error::config_field_invalid("scheduler.tick_interval_ms", "must be at least 1"));
        }

        // Gates
        if self.gates.max_attempts == 0 {
            return Err(Error::config_field_invalid("gates.max_attempts", "must be at least 1"));
        }
        for (kind, checks) in &self.gates.kinds {
            kind.parse::<RequestKind>()
                .map_err(|e| Error::config_field_invalid(format!("gates.kinds.{}", kind), e))?;
            for name in checks {
                if !self.gates.checks.contains_key(name) {
                    return Err(Error::config_field_invalid(
                        format!("gates.kinds.{}", kind),
                        format!("check '{}' is not defined in [gates.checks]", name),
                    ));
                }
            }
        }
        for (name, check) in &self.gates.checks {
            let field = format!("gates.checks.{}", name);
            match check.adapter {
                CheckAdapter::Command | CheckAdapter::Coverage if check.program.is_none() => {
                    return Err(Error::config_field_invalid(field, "program is required"));
                }
                CheckAdapter::Coverage => match check.threshold {
                    Some(t) if (0.0..=100.0).contains(&t) => {}
                    _ => {
                        return Err(Error::config_field_invalid(
                            field,
                            "coverage threshold must be between 0 and 100",
                        ))
                    }
                },
                _ => {}
            }
        }

        // Repository
        if self.repository.main_branch.trim().is_empty() {
            return Err(Error::config_field_invalid("repository.main_branch", "must not be empty"));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Derived Values
    // ─────────────────────────────────────────────────────────────

    /// Ordered check names required for `kind`
    pub fn checks_for(&self, kind: RequestKind) -> Vec<String> {
        self.gates
            .kinds
            .iter()
            .find(|(k, _)| k.parse::<RequestKind>().ok() == Some(kind))
            .map(|(_, checks)| checks.clone())
            .unwrap_or_default()
    }

    /// Gate concurrency with 0 resolved to the CPU count
    pub fn gate_concurrency(&self) -> usize {
        if self.gates.max_concurrent == 0 {
            num_cpus::get().max(1)
        } else {
            self.gates.max_concurrent
        }
    }

    /// Worker id for client commands
    pub fn worker_id(&self) -> String {
        self.coordinator.worker_id.clone().unwrap_or_else(default_worker_id)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn requests_path(&self) -> PathBuf {
        self.data_dir().join("requests.jsonl")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir().join("ledger.jsonl")
    }

    pub fn approvals_path(&self) -> PathBuf {
        self.data_dir().join("approvals.jsonl")
    }

    /// Journal of the memory repository backend
    pub fn repository_journal_path(&self) -> PathBuf {
        self.data_dir().join("repository.jsonl")
    }

    /// Per-attempt check worktrees (git backend)
    pub fn worktree_dir(&self) -> PathBuf {
        self.data_dir().join("worktrees")
    }

    pub fn registry_path(&self) -> PathBuf {
        PathBuf::from(&self.registry.path)
    }
}

/// Hostname, or "worker" when it cannot be determined
pub fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".gatekeeper")
                .join("gatekeeper.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# Commit Gatekeeper Configuration

[coordinator]
# Address the coordinator listens on (gatekeeper serve)
listen_addr = "127.0.0.1:7420"

# URL client commands connect to
url = "ws://127.0.0.1:7420"

# Worker id for client commands (defaults to the hostname)
# worker_id = "w1"

# Connection timeout in milliseconds
connect_timeout_ms = 5000

# Time to wait for a reply in milliseconds
request_timeout_ms = 30000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 5

[mailbox]
# Identical resubmissions within this window are duplicates
dedup_window_secs = 300

# Maximum requests queued for validation
capacity = 1024

[validation]
# Admission timeout in milliseconds
timeout_ms = 10000
max_target_paths = 256
max_path_len = 1024
max_description_len = 16384

# Overlapping requests without a dependency: "race" or "reject_early"
conflict_policy = "race"

[scheduler]
# Longest a request may wait on its dependencies
dependency_timeout_secs = 3600

# Timeout sweep interval in milliseconds
tick_interval_ms = 1000

[gates]
# Timeout for checks without their own, in milliseconds
default_timeout_ms = 600000

# Gate runs in parallel (0 = number of CPUs)
max_concurrent = 0

# Skip remaining checks after the first failure
fail_fast = true

# Attempts per request before it is force-failed
max_attempts = 3

[gates.kinds]
commit = ["tests", "lint"]
merge = ["tests"]

[gates.checks.tests]
adapter = "command"
program = "cargo"
args = ["test", "--quiet"]

[gates.checks.lint]
adapter = "command"
program = "cargo"
args = ["clippy", "--quiet", "--", "-D", "warnings"]

# [gates.checks.coverage]
# adapter = "coverage"
# program = "cargo"
# args = ["llvm-cov", "--summary-only"]
# threshold = 80.0

[repository]
# Backend: "memory" or "git"
backend = "memory"
path = "."
main_branch = "main"
author_name = "Commit Gatekeeper"
author_email = "gatekeeper@localhost"

[registry]
# Protected-resource mapping file
path = "~/.gatekeeper/registry.toml"

[storage]
# Requests, ledger and approvals are kept here
data_dir = "~/.gatekeeper"
persist = true
fsync = true

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.gatekeeper/logs/gatekeeper.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
