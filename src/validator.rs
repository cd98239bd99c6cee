//! Request validation
//!
//! Checks run in order and the first failure rejects the request:
//!
//! 1. well-formedness of target paths and of the kind-specific payload
//! 2. the patch file changes nothing outside the declared target paths
//! 3. ownership of every protected path the request touches, including
//!    resources inside a declared directory and every path the patch changes
//! 4. existence of every declared dependency
//!
//! With `conflict_policy = "reject_early"` a fifth check rejects requests
//! overlapping an in-flight request from another submitter.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{ConflictPolicy, ValidationSettings};
use crate::error::{Error, Result};
use crate::ledger::StatusLedger;
use crate::registry::{ProtectedResource, SharedApprovals, SharedRegistry};
use crate::repository::diff;
use crate::types::{ApprovalId, Request, RequestId, RequestKind, WorkerId};

/// Characters never allowed in a target path
const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '{', '}'];

/// An admitted request's claim on a protected resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub path: String,
    pub pattern: String,
    pub owner: WorkerId,
    pub via: GrantSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSource {
    Owner,
    Approval(ApprovalId),
}

/// Outcome of a successful validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admitted {
    pub grants: Vec<Grant>,
}

impl Admitted {
    /// Ledger reason for the VALIDATING → WAITING_ON_DEPENDENCIES entry
    pub fn summary(&self) -> String {
        if self.grants.is_empty() {
            return "validated; no protected paths".to_string();
        }
        let parts: Vec<String> = self.grants.iter().map(ToString::to_string).collect();
        format!("validated; {}", parts.join(", "))
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.via {
            GrantSource::Owner => write!(f, "{} owned ({})", self.path, self.pattern),
            GrantSource::Approval(id) => write!(
                f,
                "{} approved by {} via approval #{} ({})",
                self.path, self.owner, id, self.pattern
            ),
        }
    }
}

/// A request that has been admitted but has not finished
#[derive(Debug, Clone)]
pub struct InFlight {
    pub id: RequestId,
    pub submitter: WorkerId,
    pub paths: BTreeSet<String>,
}

/// Validates requests against the registry and the ledger
pub struct Validator {
    limits: ValidationSettings,
    main_branch: String,
    registry: SharedRegistry,
    approvals: SharedApprovals,
    ledger: Arc<StatusLedger>,
    /// Directory relative patch paths resolve against; `None` when the
    /// backend never reads patch files
    diff_root: Option<PathBuf>,
}

impl Validator {
    pub fn new(
        limits: ValidationSettings,
        main_branch: impl Into<String>,
        registry: SharedRegistry,
        approvals: SharedApprovals,
        ledger: Arc<StatusLedger>,
    ) -> Self {
        Self {
            limits,
            main_branch: main_branch.into(),
            registry,
            approvals,
            ledger,
            diff_root: None,
        }
    }

    pub fn with_diff_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.diff_root = Some(root.into());
        self
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.limits.conflict_policy
    }

    /// Validate `request`. `in_flight` and `exempt` (the request's
    /// transitive dependencies) are only consulted under `reject_early`.
    pub fn validate(
        &self,
        request: &Request,
        in_flight: &[InFlight],
        exempt: &BTreeSet<RequestId>,
    ) -> Result<Admitted> {
        self.check_well_formed(request)?;
        let changed = self.check_patch(request)?;
        let admitted = self.check_ownership(request, &changed)?;
        self.check_dependencies(request)?;
        if self.limits.conflict_policy == ConflictPolicy::RejectEarly {
            check_conflicts(request, in_flight, exempt)?;
        }
        tracing::debug!(
            request_id = request.id,
            submitter = %request.submitter(),
            grants = admitted.grants.len(),
            "Request validated"
        );
        Ok(admitted)
    }

    // ─────────────────────────────────────────────────────────────
    // Well-formedness
    // ─────────────────────────────────────────────────────────────

    fn check_well_formed(&self, request: &Request) -> Result<()> {
        let submitter = request.submitter();
        if submitter.is_empty() || submitter.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::validation(format!("invalid submitter id '{}'", submitter)));
        }

        let paths = request.target_paths();
        if paths.len() > self.limits.max_target_paths {
            return Err(Error::validation(format!(
                "{} target paths exceed the limit of {}",
                paths.len(),
                self.limits.max_target_paths
            )));
        }

        let transfer = request.kind() == RequestKind::TransferOwnership;
        for path in paths {
            self.check_path(path, transfer)?;
        }

        let payload = &request.draft.payload;
        if payload.description.len() > self.limits.max_description_len {
            return Err(Error::validation(format!(
                "description exceeds {} bytes",
                self.limits.max_description_len
            )));
        }

        if !request.draft.approvals.is_empty() {
            let approvals = self.approvals.read();
            for id in &request.draft.approvals {
                if approvals.get(*id).is_none() {
                    return Err(Error::validation(format!("unknown approval #{}", id)));
                }
            }
        }

        match request.kind() {
            RequestKind::Commit => {
                if paths.is_empty() {
                    return Err(Error::validation("commit requires at least one target path"));
                }
            }
            RequestKind::CreateBranch | RequestKind::Merge | RequestKind::DeleteBranch => {
                let branch = payload
                    .branch
                    .as_deref()
                    .ok_or_else(|| Error::validation(format!("{} requires a branch", request.kind())))?;
                check_branch_name(branch)?;
                if request.kind() != RequestKind::CreateBranch && branch == self.main_branch {
                    return Err(Error::validation(format!(
                        "{} may not target the main branch '{}'",
                        request.kind(),
                        branch
                    )));
                }
                if request.kind() == RequestKind::CreateBranch && branch == self.main_branch {
                    return Err(Error::validation(format!("branch '{}' already exists", branch)));
                }
            }
            RequestKind::TransferOwnership => {
                if paths.len() != 1 {
                    return Err(Error::validation(
                        "transfer_ownership requires exactly one target pattern",
                    ));
                }
                let new_owner = payload
                    .new_owner
                    .as_deref()
                    .ok_or_else(|| Error::validation("transfer_ownership requires a new owner"))?;
                if new_owner.is_empty() || new_owner.chars().any(|c| c.is_whitespace() || c.is_control()) {
                    return Err(Error::validation(format!("invalid new owner '{}'", new_owner)));
                }

                let registry = self.registry.read();
                let pattern = paths.iter().next().map(String::as_str).unwrap_or_default();
                let resource = registry
                    .get(pattern)
                    .ok_or_else(|| Error::validation(format!("'{}' is not a protected resource", pattern)))?;
                if resource.owner == new_owner {
                    return Err(Error::validation(format!("'{}' is already owned by {}", pattern, new_owner)));
                }
            }
        }

        Ok(())
    }

    fn check_path(&self, path: &str, allow_glob: bool) -> Result<()> {
        let invalid = |why: &str| Error::validation(format!("invalid target path '{}': {}", path, why));

        if path.is_empty() {
            return Err(invalid("empty"));
        }
        if path.len() > self.limits.max_path_len {
            return Err(invalid(&format!("longer than {} bytes", self.limits.max_path_len)));
        }
        if path.starts_with('/') {
            return Err(invalid("absolute"));
        }
        if path.contains('\\') {
            return Err(invalid("backslash separator"));
        }
        if path.chars().any(char::is_control) {
            return Err(invalid("control character"));
        }
        if !allow_glob && path.contains(GLOB_CHARS) {
            return Err(invalid("glob characters"));
        }
        for segment in path.split('/') {
            match segment {
                "" => return Err(invalid("empty segment")),
                "." | ".." => return Err(invalid("not normalized")),
                _ => {}
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Patch
    // ─────────────────────────────────────────────────────────────

    /// Paths the request's patch file changes
    fn check_patch(&self, request: &Request) -> Result<BTreeSet<String>> {
        let (Some(root), Some(patch)) = (&self.diff_root, request.draft.payload.diff_ref.as_deref()) else {
            return Ok(BTreeSet::new());
        };
        if request.kind() != RequestKind::Commit {
            return Err(Error::validation(format!("{} does not take a diff", request.kind())));
        }

        let changed = diff::read_changed_paths(&root.join(patch))
            .map_err(|e| Error::validation(format!("diff '{}' is not readable: {}", patch, e)))?;
        if changed.is_empty() {
            return Err(Error::validation(format!("diff '{}' changes no files", patch)));
        }
        for path in &changed {
            self.check_path(path, false)?;
        }
        diff::check_declared(&changed, request.target_paths())?;
        Ok(changed)
    }

    // ─────────────────────────────────────────────────────────────
    // Ownership
    // ─────────────────────────────────────────────────────────────

    fn check_ownership(&self, request: &Request, changed: &BTreeSet<String>) -> Result<Admitted> {
        let registry = self.registry.read();
        let submitter = request.submitter();
        let mut admitted = Admitted::default();

        for path in request.target_paths().union(changed) {
            let resources: Vec<&ProtectedResource> = if request.kind() == RequestKind::TransferOwnership {
                registry.get(path).into_iter().collect()
            } else {
                registry.touching(path)
            };

            for resource in resources {
                let via = self.authorize(request, resource).ok_or_else(|| Error::OwnershipViolation {
                    path: path.clone(),
                    owner: resource.owner.clone(),
                    submitter: submitter.to_string(),
                })?;
                admitted.grants.push(Grant {
                    path: path.clone(),
                    pattern: resource.pattern.clone(),
                    owner: resource.owner.clone(),
                    via,
                });
            }
        }
        Ok(admitted)
    }

    fn authorize(&self, request: &Request, resource: &ProtectedResource) -> Option<GrantSource> {
        if resource.owner == request.submitter() {
            return Some(GrantSource::Owner);
        }

        let now = Utc::now();
        let approvals = self.approvals.read();
        request
            .draft
            .approvals
            .iter()
            .filter_map(|id| approvals.get(*id))
            .find(|a| {
                a.pattern == resource.pattern
                    && a.owner == resource.owner
                    && a.grantee == request.submitter()
                    && !a.is_expired(now)
            })
            .map(|a| GrantSource::Approval(a.id))
    }

    // ─────────────────────────────────────────────────────────────
    // Dependencies
    // ─────────────────────────────────────────────────────────────

    fn check_dependencies(&self, request: &Request) -> Result<()> {
        for dep in request.depends_on() {
            if *dep != request.id && !self.ledger.contains(*dep) {
                return Err(Error::validation(format!("unknown dependency #{}", dep)));
            }
        }
        Ok(())
    }
}

/// Whether two paths touch the same file or one contains the other
pub fn paths_overlap(a: &str, b: &str) -> bool {
    fn contains(dir: &str, path: &str) -> bool {
        path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
    }
    a == b || contains(a, b) || contains(b, a)
}

fn check_conflicts(request: &Request, in_flight: &[InFlight], exempt: &BTreeSet<RequestId>) -> Result<()> {
    for other in in_flight {
        if other.id == request.id || other.submitter == request.submitter() || exempt.contains(&other.id) {
            continue;
        }
        for path in request.target_paths() {
            if other.paths.iter().any(|p| paths_overlap(path, p)) {
                return Err(Error::ConflictingRequest {
                    path: path.clone(),
                    other: other.id,
                });
            }
        }
    }
    Ok(())
}

/// Branch names follow git's ref-name rules
fn check_branch_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Error::validation(format!("invalid branch name '{}': {}", name, why));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return Err(invalid("bad leading or trailing character"));
    }
    if name.ends_with('.') || name.ends_with(".lock") {
        return Err(invalid("bad suffix"));
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") || name == "@" {
        return Err(invalid("forbidden sequence"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(invalid("forbidden character"));
    }
    if name.split('/').any(|seg| seg.starts_with('.')) {
        return Err(invalid("component starts with '.'"));
    }
    Ok(())
}
