//! Quality-gate results

use serde::{Deserialize, Serialize};

use super::RequestId;
use crate::error::Error;

/// Why a check did not pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFailure {
    /// The check ran and reported failure
    Failed,
    /// The check exceeded its timeout
    Timeout,
    /// The check could not be run
    Error,
    /// Not run because an earlier check failed
    Skipped,
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckFailure::Failed => write!(f, "Failed"),
            CheckFailure::Timeout => write!(f, "Timeout"),
            CheckFailure::Error => write!(f, "Error"),
            CheckFailure::Skipped => write!(f, "Skipped"),
        }
    }
}

/// What a check observed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// One-line summary (e.g. "coverage 81.2% >= 80%")
    pub summary: String,

    /// Longer output (tail of the check's output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CheckFailure>,
}

/// Outcome of one named check for one attempt of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub request_id: RequestId,
    pub attempt: u32,
    pub check_name: String,
    pub passed: bool,
    pub evidence: Evidence,
}

impl QualityGateResult {
    /// Short human-readable line, e.g. `tests: FAIL (Timeout) exceeded 500ms`
    pub fn describe(&self) -> String {
        match (self.passed, self.evidence.failure) {
            (true, _) => format!("{}: PASS {}", self.check_name, self.evidence.summary),
            (false, Some(kind)) => {
                format!("{}: FAIL ({}) {}", self.check_name, kind, self.evidence.summary)
            }
            (false, None) => format!("{}: FAIL {}", self.check_name, self.evidence.summary),
        }
    }

    /// The gate error a failed result stands for
    pub fn to_error(&self) -> Option<Error> {
        match (self.passed, self.evidence.failure) {
            (true, _) => None,
            (false, Some(CheckFailure::Timeout)) => Some(Error::GateTimeout {
                check: self.check_name.clone(),
                timeout_ms: self.evidence.duration_ms,
            }),
            (false, _) => Some(Error::GateFailure {
                check: self.check_name.clone(),
                message: self.evidence.summary.clone(),
            }),
        }
    }
}

/// True when `results` is a full pass of `required` for `attempt`
pub fn all_passed(results: &[QualityGateResult], required: &[String], attempt: u32) -> bool {
    required.iter().all(|name| {
        results
            .iter()
            .any(|r| &r.check_name == name && r.attempt == attempt && r.passed)
    })
}
