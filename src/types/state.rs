//! Request lifecycle states and the legal transitions between them

use serde::{Deserialize, Serialize};

use crate::error::{EXIT_GATE_FAILED, EXIT_OK, EXIT_REJECTED};

/// Lifecycle state of a request
///
/// The happy path is PENDING → VALIDATING → WAITING_ON_DEPENDENCIES →
/// TESTING → COMMITTING → COMPLETED. GATE_FAILED and ROLLED_BACK may re-enter
/// PENDING as a new attempt; every other terminal state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Validating,
    WaitingOnDependencies,
    Testing,
    Committing,
    Completed,
    Rejected,
    GateFailed,
    RolledBack,
    Cancelled,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "PENDING",
            RequestState::Validating => "VALIDATING",
            RequestState::WaitingOnDependencies => "WAITING_ON_DEPENDENCIES",
            RequestState::Testing => "TESTING",
            RequestState::Committing => "COMMITTING",
            RequestState::Completed => "COMPLETED",
            RequestState::Rejected => "REJECTED",
            RequestState::GateFailed => "GATE_FAILED",
            RequestState::RolledBack => "ROLLED_BACK",
            RequestState::Cancelled => "CANCELLED",
        }
    }

    /// No further transition within the current attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Rejected
                | RequestState::GateFailed
                | RequestState::RolledBack
                | RequestState::Cancelled
        )
    }

    /// Terminal failure that a resubmission may retry
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, RequestState::GateFailed | RequestState::RolledBack)
    }

    /// Terminal failure that no resubmission can recover
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, RequestState::Rejected | RequestState::Cancelled)
    }

    /// Cancellation takes effect immediately in these states
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            RequestState::Pending | RequestState::Validating | RequestState::WaitingOnDependencies
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// A retry (`GATE_FAILED|ROLLED_BACK -> PENDING`) is legal here; the
    /// ledger additionally requires it to start a new attempt.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        match self {
            Pending => matches!(next, Validating | Rejected | GateFailed | Cancelled),
            Validating => matches!(next, WaitingOnDependencies | Rejected | GateFailed | Cancelled),
            WaitingOnDependencies => matches!(next, Testing | Rejected | GateFailed | Cancelled),
            Testing => matches!(next, Committing | Rejected | GateFailed | Cancelled),
            Committing => matches!(next, Completed | RolledBack),
            GateFailed | RolledBack => next == Pending,
            Completed | Rejected | Cancelled => false,
        }
    }

    /// CLI exit code when reporting a request in this state
    pub fn exit_code(&self) -> i32 {
        match self {
            RequestState::Rejected | RequestState::Cancelled => EXIT_REJECTED,
            RequestState::GateFailed | RequestState::RolledBack => EXIT_GATE_FAILED,
            _ => EXIT_OK,
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
