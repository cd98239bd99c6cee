//! Protocol message definitions
//!
//! All message types for worker ↔ coordinator communication.
//! Messages are serialized as JSON with a type discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::error::Error;
use crate::ledger::LedgerEntry;
use crate::registry::{Approval, ApprovalGrant};
use crate::types::{QualityGateResult, RequestDraft, RequestId, RequestKind, RequestState, WorkerId};

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Protocol version
    pub version: ProtocolVersion,

    /// Request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Uuid>,

    /// The actual message payload
    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    /// Create a new message envelope
    pub fn new(payload: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::CURRENT,
            in_reply_to: None,
            payload,
        }
    }

    /// Create a reply to `request`
    pub fn reply(request: Uuid, payload: Message) -> Self {
        Self {
            in_reply_to: Some(request),
            ..Self::new(payload)
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Worker → Coordinator ───────────────────────────────────
    /// Submit a change request
    Submit(RequestDraft),

    /// Current state of one request
    Status(StatusQuery),

    /// Ledger history of one request, or of all
    Ledger(LedgerQuery),

    /// Cancel a request
    Cancel(CancelMessage),

    /// Record an approval
    Approve(ApprovalGrant),

    /// Reload the protected-resource registry
    Reload(ReloadMessage),

    /// Stream ledger entries
    Subscribe(SubscribeMessage),

    // ─── Coordinator → Worker ───────────────────────────────────
    /// Admission result
    SubmitAck(SubmitAck),

    StatusReply(StatusReport),

    LedgerReply(LedgerReply),

    CancelAck(CancelAck),

    ApproveAck(ApproveAck),

    ReloadAck(ReloadAck),

    /// One ledger entry on a subscription
    LedgerEvent(LedgerEvent),

    /// Error response
    Error(ErrorMessage),
}

impl Message {
    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Submit(_) => "SUBMIT",
            Message::Status(_) => "STATUS",
            Message::Ledger(_) => "LEDGER",
            Message::Cancel(_) => "CANCEL",
            Message::Approve(_) => "APPROVE",
            Message::Reload(_) => "RELOAD",
            Message::Subscribe(_) => "SUBSCRIBE",
            Message::SubmitAck(_) => "SUBMIT_ACK",
            Message::StatusReply(_) => "STATUS_REPLY",
            Message::LedgerReply(_) => "LEDGER_REPLY",
            Message::CancelAck(_) => "CANCEL_ACK",
            Message::ApproveAck(_) => "APPROVE_ACK",
            Message::ReloadAck(_) => "RELOAD_ACK",
            Message::LedgerEvent(_) => "LEDGER_EVENT",
            Message::Error(_) => "ERROR",
        }
    }

    /// Check if this is a request message (worker → coordinator)
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Submit(_)
                | Message::Status(_)
                | Message::Ledger(_)
                | Message::Cancel(_)
                | Message::Approve(_)
                | Message::Reload(_)
                | Message::Subscribe(_)
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusQuery {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// All requests when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
    pub request_id: RequestId,

    /// Worker asking for the cancellation
    pub by: WorkerId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadMessage {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeMessage {
    /// Only entries of this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Replay recorded entries after this sequence number first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────
// Replies
// ─────────────────────────────────────────────────────────────────

/// Synchronous admission result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Validated and waiting on dependencies
    Accepted { request_id: RequestId },

    /// Validation failed; the request is REJECTED
    Rejected {
        request_id: RequestId,
        code: String,
        reason: String,
    },

    /// Same content already submitted within the window
    Duplicate {
        request_id: RequestId,
        state: RequestState,
        attempt: u32,
    },

    /// Resubmission of a retryable failure; a new attempt was admitted
    Retried { request_id: RequestId, attempt: u32 },

    /// Cancelled before admission finished
    Cancelled { request_id: RequestId },
}

impl SubmitOutcome {
    pub fn request_id(&self) -> RequestId {
        match self {
            SubmitOutcome::Accepted { request_id }
            | SubmitOutcome::Rejected { request_id, .. }
            | SubmitOutcome::Duplicate { request_id, .. }
            | SubmitOutcome::Retried { request_id, .. }
            | SubmitOutcome::Cancelled { request_id } => *request_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmitOutcome::Accepted { .. } => "ACCEPTED",
            SubmitOutcome::Rejected { .. } => "REJECTED",
            SubmitOutcome::Duplicate { .. } => "DUPLICATE",
            SubmitOutcome::Retried { .. } => "RETRIED",
            SubmitOutcome::Cancelled { .. } => "CANCELLED",
        }
    }

    /// CLI exit code for the admission result
    pub fn exit_code(&self) -> i32 {
        match self {
            SubmitOutcome::Rejected { .. } | SubmitOutcome::Cancelled { .. } => crate::error::EXIT_REJECTED,
            SubmitOutcome::Duplicate { state, .. } => state.exit_code(),
            _ => crate::error::EXIT_OK,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAck {
    pub result: SubmitOutcome,
}

/// Current state of a request and its latest gate results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub request_id: RequestId,
    pub submitter: WorkerId,
    pub kind: RequestKind,
    pub state: RequestState,
    pub attempt: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Results of the latest attempt only
    #[serde(default)]
    pub gate_results: Vec<QualityGateResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReply {
    pub entries: Vec<LedgerEntry>,
}

/// How a cancellation was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Recorded CANCELLED
    Cancelled,
    /// Takes effect when the running gate attempt ends
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAck {
    pub request_id: RequestId,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveAck {
    pub approval: Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadAck {
    /// Number of protected resources after the reload
    pub resources: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub entry: LedgerEntry,
}

/// Error message from coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code (e.g. "E401")
    pub code: String,

    /// Human-readable message
    pub message: String,

    #[serde(default)]
    pub retryable: bool,
}

impl From<&Error> for ErrorMessage {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().as_str(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<ErrorMessage> for Error {
    fn from(msg: ErrorMessage) -> Self {
        Error::Remote {
            code: msg.code,
            message: msg.message,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Helpers
// ─────────────────────────────────────────────────────────────────

impl MessageEnvelope {
    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
