//! Approval records
//!
//! An owner grants a named worker the right to change one of the owner's
//! protected resources. Approvals are persisted as JSON lines and referenced
//! by id when a request is submitted.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceRegistry;
use crate::error::{Error, Result};
use crate::storage::JsonLines;
use crate::types::{ApprovalId, WorkerId};

/// A recorded approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    /// Owner of `pattern` at grant time
    pub owner: WorkerId,
    /// Worker allowed to change the resource
    pub grantee: WorkerId,
    /// Registered resource pattern this approval covers
    pub pattern: String,
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Approval {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Parameters of a new approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalGrant {
    pub owner: WorkerId,
    pub grantee: WorkerId,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// All recorded approvals
pub struct ApprovalStore {
    approvals: BTreeMap<ApprovalId, Approval>,
    log: Option<JsonLines>,
}

impl ApprovalStore {
    pub fn in_memory() -> Self {
        Self {
            approvals: BTreeMap::new(),
            log: None,
        }
    }

    /// Open the store, replaying recorded approvals
    pub fn open(path: &Path, fsync: bool) -> Result<Self> {
        let records: Vec<Approval> = JsonLines::read_all(path)?;
        let approvals = records.into_iter().map(|a| (a.id, a)).collect();
        Ok(Self {
            approvals,
            log: Some(JsonLines::open(path, fsync)?),
        })
    }

    /// Record an approval. The pattern must be registered and `owner` must
    /// be its current owner.
    pub fn grant(&mut self, grant: ApprovalGrant, registry: &ResourceRegistry) -> Result<Approval> {
        let resource = registry.get(&grant.pattern).ok_or_else(|| {
            Error::validation(format!("'{}' is not a protected resource", grant.pattern))
        })?;
        if resource.owner != grant.owner {
            return Err(Error::OwnershipViolation {
                path: grant.pattern.clone(),
                owner: resource.owner.clone(),
                submitter: grant.owner.clone(),
            });
        }
        if grant.grantee.trim().is_empty() {
            return Err(Error::validation("approval grantee must not be empty"));
        }

        let now = Utc::now();
        let expires_at = match grant.ttl_secs {
            Some(secs) => {
                let secs = i64::try_from(secs)
                    .map_err(|_| Error::validation("approval ttl is too large"))?;
                Some(now + Duration::seconds(secs))
            }
            None => None,
        };

        let approval = Approval {
            id: self.approvals.keys().next_back().map(|id| id + 1).unwrap_or(1),
            owner: grant.owner,
            grantee: grant.grantee,
            pattern: grant.pattern,
            granted_at: now,
            expires_at,
            note: grant.note,
        };

        if let Some(log) = self.log.as_mut() {
            log.append(&approval)?;
        }
        tracing::info!(
            approval_id = approval.id,
            owner = %approval.owner,
            grantee = %approval.grantee,
            pattern = %approval.pattern,
            "Approval recorded"
        );
        self.approvals.insert(approval.id, approval.clone());
        Ok(approval)
    }

    pub fn get(&self, id: ApprovalId) -> Option<&Approval> {
        self.approvals.get(&id)
    }

    pub fn len(&self) -> usize {
        self.approvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty()
    }
}
