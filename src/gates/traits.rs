//! Quality check trait

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Request;

/// What a check gets to look at
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub request: Request,
    pub attempt: u32,
    /// Directory checks run in
    pub workdir: PathBuf,
}

impl CheckContext {
    /// Environment passed to external check programs
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let req = &self.request;
        let mut vars = vec![
            ("GATEKEEPER_REQUEST_ID", req.id.to_string()),
            ("GATEKEEPER_ATTEMPT", self.attempt.to_string()),
            ("GATEKEEPER_SUBMITTER", req.submitter().to_string()),
            ("GATEKEEPER_KIND", req.kind().to_string()),
            (
                "GATEKEEPER_TARGET_PATHS",
                req.target_paths().iter().cloned().collect::<Vec<_>>().join("\n"),
            ),
        ];
        if let Some(diff) = &req.draft.payload.diff_ref {
            vars.push(("GATEKEEPER_DIFF_REF", diff.clone()));
        }
        if let Some(branch) = &req.draft.payload.branch {
            vars.push(("GATEKEEPER_BRANCH", branch.clone()));
        }
        vars
    }
}

/// A check's own judgement (timeouts are decided by the runner)
#[derive(Debug, Clone, PartialEq)]
pub struct CheckVerdict {
    pub passed: bool,
    pub summary: String,
    pub detail: String,
}

impl CheckVerdict {
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
            detail: String::new(),
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// A black-box quality check
///
/// Implementations report pass/fail through [`CheckVerdict`] and return an
/// error only when the check could not be run at all.
#[async_trait]
pub trait QualityCheck: Send + Sync {
    fn name(&self) -> &str;

    fn timeout(&self) -> Duration;

    async fn run(&self, ctx: &CheckContext) -> Result<CheckVerdict>;
}
