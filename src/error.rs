//! Error types for the commit gatekeeper
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retry classification matching the gating protocol
//! - Exit codes for the CLI (0 ok, 1 rejection, 2 gate/write failure, 3 internal)

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{RequestId, RequestState};

/// Result type alias for gatekeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// CLI exit code for success or acceptance
pub const EXIT_OK: i32 = 0;
/// CLI exit code for a validation rejection
pub const EXIT_REJECTED: i32 = 1;
/// CLI exit code for a quality-gate or write failure
pub const EXIT_GATE_FAILED: i32 = 2;
/// CLI exit code for everything else
pub const EXIT_INTERNAL: i32 = 3;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,
    RegistryInvalid = 110,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    Serialization = 210,

    // Connection / protocol errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ProtocolVersion = 310,
    ProtocolMalformed = 311,

    // Admission errors (4xx)
    ValidationError = 400,
    OwnershipViolation = 401,
    CyclicDependency = 402,
    ConflictingRequest = 403,
    CancelRefused = 404,
    AttemptsExhausted = 405,
    RequestNotFound = 406,
    MailboxFull = 407,
    UndeclaredPath = 408,

    // Quality gate errors (5xx)
    GateFailure = 500,
    GateTimeout = 501,
    CheckError = 502,

    // Commit errors (6xx)
    WriteConflict = 600,
    RepositoryError = 601,
    RevertFailed = 602,

    // Ledger errors (7xx)
    InvalidTransition = 700,
    MissingLedgerTrail = 701,
    LedgerCorrupt = 702,

    // Internal errors (9xx)
    InternalError = 900,
    AdmissionTimeout = 901,
}

impl ErrorCode {
    /// Get the string code (e.g., "E401")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCode::ValidationError
            | ErrorCode::OwnershipViolation
            | ErrorCode::CyclicDependency
            | ErrorCode::ConflictingRequest
            | ErrorCode::UndeclaredPath
            | ErrorCode::CancelRefused => EXIT_REJECTED,
            ErrorCode::AttemptsExhausted
            | ErrorCode::GateFailure
            | ErrorCode::GateTimeout
            | ErrorCode::CheckError
            | ErrorCode::WriteConflict
            | ErrorCode::RepositoryError
            | ErrorCode::RevertFailed => EXIT_GATE_FAILED,
            _ => EXIT_INTERNAL,
        }
    }

    /// Parse a string code such as "E401"
    pub fn parse(code: &str) -> Option<Self> {
        let n: u16 = code.strip_prefix('E')?.parse().ok()?;
        ErrorCode::all().iter().copied().find(|c| *c as u16 == n)
    }

    fn all() -> &'static [ErrorCode] {
        use ErrorCode::*;
        &[
            ConfigNotFound, ConfigParseError, ConfigValidation, RegistryInvalid,
            IoRead, IoWrite, IoPermission, IoNotFound, Serialization,
            ConnectionFailed, ConnectionTimeout, ProtocolVersion, ProtocolMalformed,
            ValidationError, OwnershipViolation, CyclicDependency, ConflictingRequest,
            CancelRefused, AttemptsExhausted, RequestNotFound, MailboxFull, UndeclaredPath,
            GateFailure, GateTimeout, CheckError,
            WriteConflict, RepositoryError, RevertFailed,
            InvalidTransition, MissingLedgerTrail, LedgerCorrupt,
            InternalError, AdmissionTimeout,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the gatekeeper
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protected-resource mapping is malformed
    #[error("Invalid protected-resource registry: {message}")]
    Registry { message: String, path: Option<PathBuf> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection / Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection timeout
    #[error("Connection to {url} timed out after {timeout_secs}s")]
    ConnectionTimeout { url: String, timeout_secs: u64 },

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Error reported by the coordinator over the API
    #[error("{message}")]
    Remote { code: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Admission Errors
    // ─────────────────────────────────────────────────────────────

    /// Request is malformed
    #[error("ValidationError: {message}")]
    Validation { message: String },

    /// Submitter does not own a protected path and holds no approval
    #[error("OwnershipViolation: {path} is owned by {owner}, not {submitter}")]
    OwnershipViolation {
        path: String,
        owner: String,
        submitter: String,
    },

    /// Declared dependencies form a cycle
    #[error("CyclicDependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<RequestId> },

    /// Another in-flight request targets the same paths
    #[error("ConflictingRequest: {path} is already targeted by request #{other}")]
    ConflictingRequest { path: String, other: RequestId },

    /// The change touches a path outside the declared target paths
    #[error("UndeclaredPath: {path} is changed but not declared as a target path")]
    UndeclaredPath { path: String },

    /// Cancellation is not allowed in the current state
    #[error("Cannot cancel request #{request_id}: {reason}")]
    CancelRefused { request_id: RequestId, reason: String },

    /// Retry ceiling reached
    #[error("Request #{request_id} exhausted {attempts} attempts")]
    AttemptsExhausted { request_id: RequestId, attempts: u32 },

    /// Unknown request id
    #[error("Request #{request_id} not found")]
    RequestNotFound { request_id: RequestId },

    /// Mailbox at capacity
    #[error("Mailbox full: {capacity} requests queued")]
    MailboxFull { capacity: usize },

    // ─────────────────────────────────────────────────────────────
    // Quality Gate Errors
    // ─────────────────────────────────────────────────────────────

    /// A required check failed
    #[error("GateFailure: check '{check}' failed: {message}")]
    GateFailure { check: String, message: String },

    /// A check exceeded its timeout
    #[error("Timeout: check '{check}' exceeded {timeout_ms}ms")]
    GateTimeout { check: String, timeout_ms: u64 },

    /// A check adapter could not run at all
    #[error("Check '{check}' could not run: {message}")]
    Check { check: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Commit Errors
    // ─────────────────────────────────────────────────────────────

    /// The write collided with the current repository state
    #[error("WriteConflict: {message}")]
    WriteConflict { message: String },

    /// Repository backend failure
    #[error("Repository error: {0}")]
    Repository(String),

    /// Compensating revert failed
    #[error("Revert to {revision} failed: {message}")]
    RevertFailed { revision: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Ledger Errors
    // ─────────────────────────────────────────────────────────────

    /// Transition rejected by the ledger
    #[error("Invalid transition for request #{request_id}: {} -> {to}", display_state(.from))]
    InvalidTransition {
        request_id: RequestId,
        from: Option<RequestState>,
        to: RequestState,
    },

    /// Request exists but has no recorded history
    #[error("Request #{request_id} has no ledger trail")]
    MissingLedgerTrail { request_id: RequestId },

    /// On-disk log could not be replayed
    #[error("Corrupt log {path} at line {line}: {message}")]
    LedgerCorrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Admission did not produce a verdict in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_cycle(cycle: &[RequestId]) -> String {
    cycle
        .iter()
        .map(|id| format!("#{}", id))
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn display_state(state: &Option<RequestState>) -> String {
    state.map(|s| s.to_string()).unwrap_or_else(|| "(none)".to_string())
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,
            Error::Registry { .. } => ErrorCode::RegistryInvalid,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::Serialization,
            Error::Json(_) => ErrorCode::Serialization,

            Error::WebSocket(_) => ErrorCode::ConnectionFailed,
            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::Remote { code, .. } => {
                ErrorCode::parse(code).unwrap_or(ErrorCode::InternalError)
            }

            Error::Validation { .. } => ErrorCode::ValidationError,
            Error::OwnershipViolation { .. } => ErrorCode::OwnershipViolation,
            Error::CyclicDependency { .. } => ErrorCode::CyclicDependency,
            Error::ConflictingRequest { .. } => ErrorCode::ConflictingRequest,
            Error::UndeclaredPath { .. } => ErrorCode::UndeclaredPath,
            Error::CancelRefused { .. } => ErrorCode::CancelRefused,
            Error::AttemptsExhausted { .. } => ErrorCode::AttemptsExhausted,
            Error::RequestNotFound { .. } => ErrorCode::RequestNotFound,
            Error::MailboxFull { .. } => ErrorCode::MailboxFull,

            Error::GateFailure { .. } => ErrorCode::GateFailure,
            Error::GateTimeout { .. } => ErrorCode::GateTimeout,
            Error::Check { .. } => ErrorCode::CheckError,

            Error::WriteConflict { .. } => ErrorCode::WriteConflict,
            Error::Repository(_) => ErrorCode::RepositoryError,
            Error::RevertFailed { .. } => ErrorCode::RevertFailed,

            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Error::MissingLedgerTrail { .. } => ErrorCode::MissingLedgerTrail,
            Error::LedgerCorrupt { .. } => ErrorCode::LedgerCorrupt,

            Error::Timeout(_) => ErrorCode::AdmissionTimeout,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if a new attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::GateFailure { .. }
                | Error::GateTimeout { .. }
                | Error::Check { .. }
                | Error::WriteConflict { .. }
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::MailboxFull { .. }
                | Error::Timeout(_)
        )
    }

    /// Check if the error is fatal for the request (no retry without a new request)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::OwnershipViolation { .. }
                | Error::CyclicDependency { .. }
                | Error::ConflictingRequest { .. }
                | Error::UndeclaredPath { .. }
                | Error::AttemptsExhausted { .. }
                | Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Registry { .. }
                | Error::LedgerCorrupt { .. }
        )
    }

    /// Get the exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'gatekeeper config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'gatekeeper config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::Registry { .. } => Some(
                "Each [[resource]] needs a unique pattern and exactly one owner."
            ),
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => Some(
                "Is the coordinator running? Start it with 'gatekeeper serve' or pass --url."
            ),
            Error::OwnershipViolation { .. } => Some(
                "Ask the owner to run 'gatekeeper approve' and resubmit with --approval <id>."
            ),
            Error::CyclicDependency { .. } => Some(
                "Remove the circular --depends-on reference and submit a new request."
            ),
            Error::ConflictingRequest { .. } => Some(
                "Declare the other request with --depends-on or wait until it completes."
            ),
            Error::UndeclaredPath { .. } => Some(
                "Pass every path the change touches with --path and submit again."
            ),
            Error::AttemptsExhausted { .. } => Some(
                "Change the request content (it will get a new id) before submitting again."
            ),
            Error::GateFailure { .. } | Error::GateTimeout { .. } => Some(
                "Fix the failing check and resubmit the same request to start a new attempt."
            ),
            Error::WriteConflict { .. } => Some(
                "The repository moved underneath the request. Rebase and resubmit."
            ),
            Error::LedgerCorrupt { .. } => Some(
                "The ledger is append-only; restore it from backup rather than editing it."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn registry(message: impl Into<String>) -> Self {
        Error::Registry {
            message: message.into(),
            path: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn write_conflict(message: impl Into<String>) -> Self {
        Error::WriteConflict {
            message: message.into(),
        }
    }

    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::OwnershipViolation.as_str(), "E401");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_code_parse() {
        assert_eq!(ErrorCode::parse("E402"), Some(ErrorCode::CyclicDependency));
        assert_eq!(ErrorCode::parse("E600"), Some(ErrorCode::WriteConflict));
        assert_eq!(ErrorCode::parse("E999"), None);
        assert_eq!(ErrorCode::parse("402"), None);
    }

    #[test]
    fn test_exit_codes_follow_cli_contract() {
        assert_eq!(ErrorCode::OwnershipViolation.exit_code(), EXIT_REJECTED);
        assert_eq!(ErrorCode::CyclicDependency.exit_code(), EXIT_REJECTED);
        assert_eq!(ErrorCode::ValidationError.exit_code(), EXIT_REJECTED);
        assert_eq!(ErrorCode::UndeclaredPath.exit_code(), EXIT_REJECTED);
        assert_eq!(ErrorCode::GateFailure.exit_code(), EXIT_GATE_FAILED);
        assert_eq!(ErrorCode::GateTimeout.exit_code(), EXIT_GATE_FAILED);
        assert_eq!(ErrorCode::WriteConflict.exit_code(), EXIT_GATE_FAILED);
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), EXIT_INTERNAL);
        assert_eq!(ErrorCode::MissingLedgerTrail.exit_code(), EXIT_INTERNAL);
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = Error::Remote {
            code: "E401".to_string(),
            message: "OwnershipViolation: core/main is owned by w1, not w2".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::OwnershipViolation);
        assert_eq!(err.exit_code(), EXIT_REJECTED);
    }

    #[test]
    fn test_error_display() {
        let err = Error::OwnershipViolation {
            path: "core/main".into(),
            owner: "w1".into(),
            submitter: "w2".into(),
        };
        assert_eq!(err.to_string(), "OwnershipViolation: core/main is owned by w1, not w2");

        let err = Error::CyclicDependency { cycle: vec![4, 2, 4] };
        assert_eq!(err.to_string(), "CyclicDependency: #4 -> #2 -> #4");

        let err = Error::InvalidTransition {
            request_id: 7,
            from: None,
            to: RequestState::Testing,
        };
        assert!(err.to_string().contains("(none) -> TESTING"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::GateTimeout { check: "tests".into(), timeout_ms: 10 }.is_retryable());
        assert!(Error::write_conflict("moved").is_retryable());
        assert!(!Error::validation("bad path").is_retryable());
        assert!(Error::validation("bad path").is_fatal());
        assert!(Error::CyclicDependency { cycle: vec![1, 1] }.is_fatal());
        assert!(!Error::write_conflict("moved").is_fatal());
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/gatekeeper.toml");
        let formatted = err.format_for_terminal();
        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::write_conflict("core/main changed");
        let formatted = err.format_for_log();
        assert!(formatted.contains("[E600]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
