//! Status ledger
//!
//! Append-only history of every request's lifecycle transitions. The ledger
//! is the only source of truth for "what happened": the coordinator derives
//! request state from it and workers read or subscribe to it.
//!
//! Reads are open to everyone. Writes go through a [`LedgerWriter`], which
//! only the validator and the gatekeeper hold.

mod store;
mod subscription;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{QualityGateResult, RequestId, RequestState};

pub use store::{LedgerWriter, StatusLedger};
pub use subscription::LedgerSubscription;

// ─────────────────────────────────────────────────────────────────
// Ledger Entry
// ─────────────────────────────────────────────────────────────────

/// One recorded transition. Never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Global position in the ledger (1-based, gapless)
    pub seq: u64,

    pub request_id: RequestId,

    pub attempt: u32,

    /// `None` only for the first entry of a request
    pub from: Option<RequestState>,

    pub to: RequestState,

    pub timestamp: DateTime<Utc>,

    /// Component that recorded the transition
    pub actor: String,

    /// Human-readable reason; always set for terminal states
    #[serde(default)]
    pub reason: String,

    /// Commit sequence number (COMMITTING, COMPLETED, ROLLED_BACK)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_seq: Option<u64>,

    /// Repository revision: pre-write on COMMITTING and ROLLED_BACK,
    /// post-write on COMPLETED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Last completed commit sequence the attempt is based on (PENDING)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_seq: Option<u64>,

    /// Gate results of this attempt (entries leaving TESTING)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_results: Vec<QualityGateResult>,
}

// ─────────────────────────────────────────────────────────────────
// Transition
// ─────────────────────────────────────────────────────────────────

/// A transition to be recorded. `from` is compared against the latest
/// recorded state, so concurrent writers cannot both move a request.
#[derive(Debug, Clone)]
pub struct Transition {
    pub request_id: RequestId,
    pub attempt: u32,
    pub from: Option<RequestState>,
    pub to: RequestState,
    pub reason: String,
    pub commit_seq: Option<u64>,
    pub revision: Option<String>,
    pub base_seq: Option<u64>,
    pub gate_results: Vec<QualityGateResult>,
}

impl Transition {
    pub fn new(
        request_id: RequestId,
        attempt: u32,
        from: Option<RequestState>,
        to: RequestState,
    ) -> Self {
        Self {
            request_id,
            attempt,
            from,
            to,
            reason: String::new(),
            commit_seq: None,
            revision: None,
            base_seq: None,
            gate_results: Vec::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn commit(mut self, commit_seq: u64, revision: impl Into<String>) -> Self {
        self.commit_seq = Some(commit_seq);
        self.revision = Some(revision.into());
        self
    }

    pub fn base(mut self, base_seq: u64) -> Self {
        self.base_seq = Some(base_seq);
        self
    }

    pub fn gate_results(mut self, results: Vec<QualityGateResult>) -> Self {
        self.gate_results = results;
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Writer Roles
// ─────────────────────────────────────────────────────────────────

/// Components allowed to record transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterRole {
    /// Admission: PENDING, VALIDATING, WAITING_ON_DEPENDENCIES, REJECTED,
    /// and CANCELLED before gating starts
    Validator,
    /// Execution: everything from TESTING on, plus scheduler and recovery
    /// decisions
    Gatekeeper,
}

impl WriterRole {
    pub fn actor(&self) -> &'static str {
        match self {
            WriterRole::Validator => "validator",
            WriterRole::Gatekeeper => "gatekeeper",
        }
    }

    /// States this role may record
    pub fn may_record(&self, to: RequestState) -> bool {
        use RequestState::*;
        match self {
            WriterRole::Validator => matches!(
                to,
                Pending | Validating | WaitingOnDependencies | Rejected | Cancelled
            ),
            WriterRole::Gatekeeper => !matches!(to, Validating | WaitingOnDependencies),
        }
    }
}
