//! Change requests submitted by workers

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique, monotonic request identifier
pub type RequestId = u64;

/// Worker identity (flat, no hierarchy)
pub type WorkerId = String;

/// Identifier of a recorded approval
pub type ApprovalId = u64;

// ─────────────────────────────────────────────────────────────────
// Request Kind
// ─────────────────────────────────────────────────────────────────

/// What a request asks the gatekeeper to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Apply a diff to the main branch
    Commit,
    /// Create a branch
    CreateBranch,
    /// Merge a branch into the main branch
    Merge,
    /// Delete a branch
    DeleteBranch,
    /// Hand a protected resource to a new owner
    TransferOwnership,
}

impl RequestKind {
    pub fn all() -> &'static [RequestKind] {
        &[
            RequestKind::Commit,
            RequestKind::CreateBranch,
            RequestKind::Merge,
            RequestKind::DeleteBranch,
            RequestKind::TransferOwnership,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Commit => "commit",
            RequestKind::CreateBranch => "create_branch",
            RequestKind::Merge => "merge",
            RequestKind::DeleteBranch => "delete_branch",
            RequestKind::TransferOwnership => "transfer_ownership",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let compact = normalized.replace('_', "");
        RequestKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized || k.as_str().replace('_', "") == compact)
            .ok_or_else(|| {
                format!(
                    "unknown request kind '{}' (expected one of: commit, create_branch, merge, delete_branch, transfer_ownership)",
                    s
                )
            })
    }
}

// ─────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────

/// Opaque request payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    /// Free-text description of the change
    pub description: String,

    /// Reference to the diff to apply (a patch file for the git backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_ref: Option<String>,

    /// Branch for branch operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// New owner for an ownership transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_owner: Option<WorkerId>,
}

// ─────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────

/// A request as submitted, before the coordinator assigns an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    pub submitter: WorkerId,

    /// Declared role (free text, informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    pub kind: RequestKind,

    #[serde(default)]
    pub target_paths: BTreeSet<String>,

    #[serde(default)]
    pub payload: Payload,

    #[serde(default)]
    pub depends_on: BTreeSet<RequestId>,

    /// Approvals presented for protected paths the submitter does not own
    #[serde(default)]
    pub approvals: BTreeSet<ApprovalId>,
}

/// The hashed portion of a request. Field order is fixed and sets are
/// ordered, so the JSON encoding is canonical.
#[derive(Serialize)]
struct HashedBody<'a> {
    kind: RequestKind,
    target_paths: &'a BTreeSet<String>,
    payload: &'a Payload,
    depends_on: &'a BTreeSet<RequestId>,
    approvals: &'a BTreeSet<ApprovalId>,
}

impl RequestDraft {
    pub fn new(submitter: impl Into<WorkerId>, kind: RequestKind) -> Self {
        Self {
            submitter: submitter.into(),
            role: None,
            kind,
            target_paths: BTreeSet::new(),
            payload: Payload::default(),
            depends_on: BTreeSet::new(),
            approvals: BTreeSet::new(),
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = RequestId>) -> Self {
        self.depends_on.extend(deps);
        self
    }

    pub fn with_approvals(mut self, ids: impl IntoIterator<Item = ApprovalId>) -> Self {
        self.approvals.extend(ids);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.payload.description = description.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.payload.branch = Some(branch.into());
        self
    }

    pub fn with_new_owner(mut self, owner: impl Into<WorkerId>) -> Self {
        self.payload.new_owner = Some(owner.into());
        self
    }

    /// SHA-256 over the canonical JSON of the request body (hex).
    ///
    /// The submitter and role are not part of the body; deduplication keys
    /// on submitter + hash.
    pub fn content_hash(&self) -> String {
        let body = HashedBody {
            kind: self.kind,
            target_paths: &self.target_paths,
            payload: &self.payload,
            depends_on: &self.depends_on,
            approvals: &self.approvals,
        };
        // Serializing plain strings, integers and ordered sets cannot fail.
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// An admitted request. Immutable once written to the request log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,

    #[serde(flatten)]
    pub draft: RequestDraft,

    pub content_hash: String,

    pub submitted_at: DateTime<Utc>,
}

impl Request {
    pub fn new(id: RequestId, draft: RequestDraft) -> Self {
        let content_hash = draft.content_hash();
        Self {
            id,
            draft,
            content_hash,
            submitted_at: Utc::now(),
        }
    }

    pub fn submitter(&self) -> &str {
        &self.draft.submitter
    }

    pub fn kind(&self) -> RequestKind {
        self.draft.kind
    }

    pub fn target_paths(&self) -> &BTreeSet<String> {
        &self.draft.target_paths
    }

    pub fn depends_on(&self) -> &BTreeSet<RequestId> {
        &self.draft.depends_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("commit".parse::<RequestKind>().unwrap(), RequestKind::Commit);
        assert_eq!("create-branch".parse::<RequestKind>().unwrap(), RequestKind::CreateBranch);
        assert_eq!("CreateBranch".parse::<RequestKind>().unwrap(), RequestKind::CreateBranch);
        assert_eq!("delete_branch".parse::<RequestKind>().unwrap(), RequestKind::DeleteBranch);
        assert!("push".parse::<RequestKind>().is_err());
    }

    #[test]
    fn test_kind_serde_matches_display() {
        for kind in RequestKind::all() {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_content_hash_ignores_submitter_and_order() {
        let a = RequestDraft::new("w1", RequestKind::Commit)
            .with_paths(["b.rs", "a.rs"])
            .with_description("fix");
        let b = RequestDraft::new("w2", RequestKind::Commit)
            .with_paths(["a.rs", "b.rs"])
            .with_description("fix");

        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_content_hash_covers_body() {
        let base = RequestDraft::new("w1", RequestKind::Commit).with_paths(["a.rs"]);
        let with_dep = base.clone().with_dependencies([3]);
        let other_kind = RequestDraft::new("w1", RequestKind::Merge).with_paths(["a.rs"]);

        assert_ne!(base.content_hash(), with_dep.content_hash());
        assert_ne!(base.content_hash(), other_kind.content_hash());
    }

    #[test]
    fn test_request_json_is_flat() {
        let req = Request::new(7, RequestDraft::new("w1", RequestKind::Commit).with_paths(["core/main"]));
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["submitter"], "w1");
        assert_eq!(json["kind"], "commit");

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
