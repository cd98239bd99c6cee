//! In-flight request tracking
//!
//! Tracks requests between admission and their final ledger entry: which
//! phase they are in, who is waiting on the admission verdict, and
//! deferred cancellations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::types::{Request, RequestId, WorkerId};
use crate::validator::InFlight;

// ─────────────────────────────────────────────────────────────────
// Request Phase
// ─────────────────────────────────────────────────────────────────

/// Where an in-flight request is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// In the mailbox
    #[default]
    Queued,
    Validating,
    Waiting,
    Testing,
    /// Inside the write critical section; no longer cancellable
    Committing,
}

/// Admission verdict delivered to the submitter
#[derive(Debug)]
pub enum Verdict {
    Admitted,
    Rejected(Error),
    Cancelled,
}

// ─────────────────────────────────────────────────────────────────
// Active Request
// ─────────────────────────────────────────────────────────────────

/// A request being tracked
#[derive(Debug)]
pub struct ActiveRequest {
    pub request: Arc<Request>,

    pub attempt: u32,

    pub phase: Phase,

    /// When the attempt was admitted
    pub received_at: Instant,

    /// When gating started
    pub started_at: Option<Instant>,

    /// Worker that asked for a deferred cancellation
    pub cancel_requested_by: Option<WorkerId>,

    /// Submitter waiting on the admission verdict
    waiter: Option<oneshot::Sender<Verdict>>,
}

impl ActiveRequest {
    pub fn new(request: Arc<Request>, attempt: u32) -> Self {
        Self {
            request,
            attempt,
            phase: Phase::Queued,
            received_at: Instant::now(),
            started_at: None,
            cancel_requested_by: None,
            waiter: None,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase == Phase::Testing {
            self.started_at = Some(Instant::now());
        }
        self.phase = phase;
    }

    /// Time from admission to now, in milliseconds
    pub fn age_ms(&self) -> u64 {
        self.received_at.elapsed().as_millis() as u64
    }
}

// ─────────────────────────────────────────────────────────────────
// Request Tracker
// ─────────────────────────────────────────────────────────────────

/// Tracks all in-flight requests
#[derive(Default)]
pub struct RequestTracker {
    requests: RwLock<HashMap<RequestId, ActiveRequest>>,

    /// Requests finished since startup
    completed_count: RwLock<u64>,
    failed_count: RwLock<u64>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new attempt. Returns the receiver for the admission verdict.
    pub fn admit(&self, request: Arc<Request>, attempt: u32) -> oneshot::Receiver<Verdict> {
        let (tx, rx) = oneshot::channel();
        let mut active = ActiveRequest::new(request, attempt);
        active.waiter = Some(tx);
        self.requests.write().insert(active.request.id, active);
        rx
    }

    /// Track an attempt nobody waits on (recovery)
    pub fn resume(&self, request: Arc<Request>, attempt: u32, phase: Phase) {
        let mut active = ActiveRequest::new(request, attempt);
        active.set_phase(phase);
        self.requests.write().insert(active.request.id, active);
    }

    pub fn set_phase(&self, id: RequestId, phase: Phase) -> bool {
        match self.requests.write().get_mut(&id) {
            Some(active) => {
                active.set_phase(phase);
                true
            }
            None => false,
        }
    }

    /// Enter the write critical section unless a cancellation is pending
    pub fn begin_commit(&self, id: RequestId) -> bool {
        let mut requests = self.requests.write();
        match requests.get_mut(&id) {
            Some(active) if active.cancel_requested_by.is_none() => {
                active.set_phase(Phase::Committing);
                true
            }
            _ => false,
        }
    }

    /// Ask for cancellation at the end of the running attempt. Refused once
    /// the request is committing.
    pub fn request_cancel(&self, id: RequestId, by: &str) -> bool {
        let mut requests = self.requests.write();
        match requests.get_mut(&id) {
            Some(active) if active.phase != Phase::Committing => {
                active.cancel_requested_by = Some(by.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn cancel_requested(&self, id: RequestId) -> Option<WorkerId> {
        self.requests
            .read()
            .get(&id)
            .and_then(|a| a.cancel_requested_by.clone())
    }

    /// Deliver the admission verdict, if anyone is still waiting
    pub fn resolve(&self, id: RequestId, verdict: Verdict) {
        let waiter = self.requests.write().get_mut(&id).and_then(|a| a.waiter.take());
        if let Some(tx) = waiter {
            let _ = tx.send(verdict);
        }
    }

    /// Stop tracking a request that reached a final state for its attempt
    pub fn finish(&self, id: RequestId, completed: bool) {
        let Some(active) = self.requests.write().remove(&id) else {
            return;
        };
        if completed {
            *self.completed_count.write() += 1;
        } else {
            *self.failed_count.write() += 1;
        }
        debug!(
            request_id = id,
            attempt = active.attempt,
            age_ms = active.age_ms(),
            gating_ms = active.started_at.map(|t| t.elapsed().as_millis() as u64),
            completed,
            "Request finished"
        );
    }

    /// Request and attempt of a tracked request
    pub fn get(&self, id: RequestId) -> Option<(Arc<Request>, u32)> {
        self.requests
            .read()
            .get(&id)
            .map(|a| (Arc::clone(&a.request), a.attempt))
    }

    /// Admitted requests that have not finished
    pub fn in_flight(&self) -> Vec<InFlight> {
        self.requests
            .read()
            .values()
            .filter(|a| a.phase != Phase::Queued)
            .map(|a| InFlight {
                id: a.request.id,
                submitter: a.request.submitter().to_string(),
                paths: a.request.target_paths().clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn total_completed(&self) -> u64 {
        *self.completed_count.read()
    }

    pub fn total_failed(&self) -> u64 {
        *self.failed_count.read()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestDraft, RequestKind};

    fn request(id: RequestId) -> Arc<Request> {
        Arc::new(Request::new(id, RequestDraft::new("w1", RequestKind::Commit).with_paths(["a"])))
    }

    #[test]
    fn test_lifecycle() {
        let tracker = RequestTracker::new();
        let _rx = tracker.admit(request(1), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.in_flight().is_empty());

        tracker.set_phase(1, Phase::Validating);
        assert_eq!(tracker.in_flight().len(), 1);

        tracker.finish(1, true);
        assert!(tracker.get(1).is_none());
        assert_eq!(tracker.total_completed(), 1);
        assert_eq!(tracker.total_failed(), 0);
    }

    #[test]
    fn test_verdict_reaches_waiter() {
        let tracker = RequestTracker::new();
        let rx = tracker.admit(request(1), 1);
        tracker.resolve(1, Verdict::Admitted);
        assert!(matches!(tokio_test::block_on(rx), Ok(Verdict::Admitted)));
    }

    #[test]
    fn test_finish_drops_waiter() {
        let tracker = RequestTracker::new();
        let rx = tracker.admit(request(1), 1);
        tracker.finish(1, false);
        assert!(tokio_test::block_on(rx).is_err());
    }

    #[test]
    fn test_cancel_before_commit_blocks_commit() {
        let tracker = RequestTracker::new();
        tracker.resume(request(1), 1, Phase::Testing);

        assert!(tracker.request_cancel(1, "w1"));
        assert_eq!(tracker.cancel_requested(1).as_deref(), Some("w1"));
        assert!(!tracker.begin_commit(1));
    }

    #[test]
    fn test_cancel_refused_while_committing() {
        let tracker = RequestTracker::new();
        tracker.resume(request(1), 1, Phase::Testing);

        assert!(tracker.begin_commit(1));
        assert!(!tracker.request_cancel(1, "w1"));
        assert!(!tracker.request_cancel(2, "w1"));
    }
}
