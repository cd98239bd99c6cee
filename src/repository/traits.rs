//! Repository trait definitions
//!
//! The gatekeeper is the only caller of these methods and always holds the
//! write lock while doing so.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Request, RequestId};

// ─────────────────────────────────────────────────────────────────
// Commit Plan & Receipt
// ─────────────────────────────────────────────────────────────────

/// Everything a backend needs to apply one request
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub request: Request,
    pub attempt: u32,

    /// Global commit sequence assigned at lock acquisition
    pub commit_seq: u64,

    /// Last completed commit sequence when the attempt was admitted
    pub base_seq: u64,

    /// Requests whose writes never conflict with this one (its transitive
    /// dependencies)
    pub exempt: BTreeSet<RequestId>,
}

/// Result of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Post-write revision
    pub revision: String,

    /// Paths the write touched
    pub paths: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────

/// Last writer of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub commit_seq: u64,
    pub request_id: RequestId,
}

/// Read-only view of the repository between writes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub revision: String,

    /// Commit sequence of the last completed write
    pub commit_seq: u64,

    pub branches: BTreeSet<String>,

    /// Tracked paths (memory backend only)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileVersion>,
}

// ─────────────────────────────────────────────────────────────────
// Repository Trait
// ─────────────────────────────────────────────────────────────────

/// A shared repository the gatekeeper writes to
#[async_trait]
pub trait Repository: Send + Sync {
    /// Backend name ("memory", "git")
    fn name(&self) -> &'static str;

    /// Current revision
    async fn revision(&self) -> Result<String>;

    /// Apply a request. On error the repository may hold a partial write;
    /// the caller reverts it.
    async fn apply(&mut self, plan: &CommitPlan) -> Result<CommitReceipt>;

    /// Restore the repository to `revision`
    async fn revert(&mut self, revision: &str) -> Result<()>;

    /// Current contents
    async fn snapshot(&self) -> Result<RepoSnapshot>;
}
