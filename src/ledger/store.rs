//! Ledger storage: in-memory index over an append-only JSON-lines file

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{LedgerEntry, LedgerSubscription, Transition, WriterRole};
use crate::error::{Error, Result};
use crate::storage::JsonLines;
use crate::types::{RequestId, RequestState};

/// Capacity of the notification channel before slow subscribers lag
const EVENT_CAPACITY: usize = 1024;

struct Inner {
    entries: Vec<LedgerEntry>,
    by_request: HashMap<RequestId, Vec<usize>>,
    /// Request currently holding COMMITTING, if any
    committing: Option<RequestId>,
    log: Option<JsonLines>,
}

impl Inner {
    fn latest(&self, id: RequestId) -> Option<&LedgerEntry> {
        self.by_request
            .get(&id)
            .and_then(|idx| idx.last())
            .map(|&i| &self.entries[i])
    }

    fn index(&mut self, entry: LedgerEntry) {
        match entry.to {
            RequestState::Committing => self.committing = Some(entry.request_id),
            RequestState::Completed | RequestState::RolledBack
                if self.committing == Some(entry.request_id) =>
            {
                self.committing = None
            }
            _ => {}
        }
        self.by_request
            .entry(entry.request_id)
            .or_default()
            .push(self.entries.len());
        self.entries.push(entry);
    }
}

/// The status ledger
pub struct StatusLedger {
    inner: Mutex<Inner>,
    events: broadcast::Sender<LedgerEntry>,
}

impl StatusLedger {
    /// Ledger that is not persisted
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::from_parts(Vec::new(), None))
    }

    /// Open the ledger at `path`, replaying existing entries
    pub fn open(path: &Path, fsync: bool) -> Result<Arc<Self>> {
        let entries: Vec<LedgerEntry> = JsonLines::read_all(path)?;

        for (i, entry) in entries.iter().enumerate() {
            if entry.seq != i as u64 + 1 {
                return Err(Error::LedgerCorrupt {
                    path: path.to_path_buf(),
                    line: i + 1,
                    message: format!("expected seq {}, found {}", i + 1, entry.seq),
                });
            }
        }

        let log = JsonLines::open(path, fsync)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "Status ledger opened");
        Ok(Arc::new(Self::from_parts(entries, Some(log))))
    }

    fn from_parts(entries: Vec<LedgerEntry>, log: Option<JsonLines>) -> Self {
        let mut inner = Inner {
            entries: Vec::with_capacity(entries.len()),
            by_request: HashMap::new(),
            committing: None,
            log,
        };
        for entry in entries {
            inner.index(entry);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(inner),
            events,
        }
    }

    /// Hand out a writer for one of the authorized components
    pub fn writer(self: &Arc<Self>, role: WriterRole) -> LedgerWriter {
        LedgerWriter {
            ledger: Arc::clone(self),
            role,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Append
    // ─────────────────────────────────────────────────────────────

    fn append(&self, role: WriterRole, t: Transition) -> Result<LedgerEntry> {
        if !role.may_record(t.to) {
            return Err(Error::Internal(format!(
                "{} may not record {}",
                role.actor(),
                t.to
            )));
        }

        let mut inner = self.inner.lock();

        let (current, current_attempt) = match inner.latest(t.request_id) {
            Some(e) => (Some(e.to), e.attempt),
            None => (None, 0),
        };

        let invalid = || Error::InvalidTransition {
            request_id: t.request_id,
            from: current,
            to: t.to,
        };

        if t.from != current {
            return Err(invalid());
        }

        let legal = match current {
            None => t.to == RequestState::Pending && t.attempt == 1,
            Some(state) if state.is_retryable_failure() => {
                state.can_transition_to(t.to) && t.attempt == current_attempt + 1
            }
            Some(state) => state.can_transition_to(t.to) && t.attempt == current_attempt,
        };
        if !legal {
            return Err(invalid());
        }

        if t.to == RequestState::Committing {
            if let Some(holder) = inner.committing {
                return Err(Error::Internal(format!(
                    "request #{} entered COMMITTING while #{} holds it",
                    t.request_id, holder
                )));
            }
        }

        let entry = LedgerEntry {
            seq: inner.entries.len() as u64 + 1,
            request_id: t.request_id,
            attempt: t.attempt,
            from: t.from,
            to: t.to,
            timestamp: Utc::now(),
            actor: role.actor().to_string(),
            reason: t.reason,
            commit_seq: t.commit_seq,
            revision: t.revision,
            base_seq: t.base_seq,
            gate_results: t.gate_results,
        };

        if let Some(log) = inner.log.as_mut() {
            log.append(&entry)?;
        }
        inner.index(entry.clone());

        tracing::debug!(
            seq = entry.seq,
            request_id = entry.request_id,
            attempt = entry.attempt,
            to = %entry.to,
            actor = %entry.actor,
            "Ledger entry recorded"
        );

        // Sent under the lock so subscribers observe entries in seq order.
        let _ = self.events.send(entry.clone());
        Ok(entry)
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// Full history of one request
    pub fn query(&self, id: RequestId) -> Vec<LedgerEntry> {
        let inner = self.inner.lock();
        inner
            .by_request
            .get(&id)
            .map(|idx| idx.iter().map(|&i| inner.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Most recent entry for a request
    pub fn latest(&self, id: RequestId) -> Option<LedgerEntry> {
        self.inner.lock().latest(id).cloned()
    }

    /// Current state and attempt of a request
    pub fn state_of(&self, id: RequestId) -> Option<(RequestState, u32)> {
        self.inner.lock().latest(id).map(|e| (e.to, e.attempt))
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().by_request.contains_key(&id)
    }

    /// Every entry with `seq > after`
    pub fn entries_after(&self, after: u64) -> Vec<LedgerEntry> {
        let inner = self.inner.lock();
        let start = (after as usize).min(inner.entries.len());
        inner.entries[start..].to_vec()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries_after(0)
    }

    /// Latest entry of every request
    pub fn latest_entries(&self) -> Vec<LedgerEntry> {
        let inner = self.inner.lock();
        let mut latest: Vec<LedgerEntry> = inner
            .by_request
            .values()
            .filter_map(|idx| idx.last().map(|&i| inner.entries[i].clone()))
            .collect();
        latest.sort_by_key(|e| e.request_id);
        latest
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().entries.len() as u64
    }

    /// Request currently in COMMITTING
    pub fn committing(&self) -> Option<RequestId> {
        self.inner.lock().committing
    }

    // ─────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────

    /// Stream of future entries matching `predicate`
    pub fn subscribe<F>(self: &Arc<Self>, predicate: F) -> LedgerSubscription
    where
        F: Fn(&LedgerEntry) -> bool + Send + Sync + 'static,
    {
        let last_seq = self.last_seq();
        self.subscribe_after(last_seq, predicate)
    }

    /// Stream of matching entries with `seq > after`, starting with the
    /// already recorded ones
    pub fn subscribe_after<F>(self: &Arc<Self>, after: u64, predicate: F) -> LedgerSubscription
    where
        F: Fn(&LedgerEntry) -> bool + Send + Sync + 'static,
    {
        // Subscribe before reading the backlog so nothing falls in between.
        let rx = self.events.subscribe();
        LedgerSubscription::new(Arc::clone(self), rx, after, Box::new(predicate))
    }
}

// ─────────────────────────────────────────────────────────────────
// Writer Handle
// ─────────────────────────────────────────────────────────────────

/// Capability to record transitions, held by the validator and the gatekeeper
#[derive(Clone)]
pub struct LedgerWriter {
    ledger: Arc<StatusLedger>,
    role: WriterRole,
}

impl LedgerWriter {
    pub fn role(&self) -> WriterRole {
        self.role
    }

    pub fn ledger(&self) -> &Arc<StatusLedger> {
        &self.ledger
    }

    /// Record a transition (compare-and-set against the latest state)
    pub fn record(&self, transition: Transition) -> Result<LedgerEntry> {
        self.ledger.append(self.role, transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn admit(w: &LedgerWriter, id: RequestId) {
        w.record(Transition::new(id, 1, None, RequestState::Pending).base(0)).unwrap();
    }

    fn walk_to_testing(v: &LedgerWriter, g: &LedgerWriter, id: RequestId, attempt: u32) {
        use RequestState::*;
        v.record(Transition::new(id, attempt, Some(Pending), Validating)).unwrap();
        v.record(Transition::new(id, attempt, Some(Validating), WaitingOnDependencies)).unwrap();
        g.record(Transition::new(id, attempt, Some(WaitingOnDependencies), Testing)).unwrap();
    }

    #[test]
    fn test_record_and_query() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);

        admit(&v, 1);
        v.record(Transition::new(1, 1, Some(RequestState::Pending), RequestState::Validating))
            .unwrap();

        let history = ledger.query(1);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 1);
        assert_eq!(history[1].from, Some(RequestState::Pending));
        assert_eq!(ledger.state_of(1), Some((RequestState::Validating, 1)));
        assert!(ledger.contains(1));
        assert!(!ledger.contains(2));
    }

    #[test]
    fn test_stale_from_is_rejected() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        admit(&v, 1);

        let err = v
            .record(Transition::new(1, 1, Some(RequestState::Validating), RequestState::WaitingOnDependencies))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        // Same transition twice: the second loses the compare-and-set.
        v.record(Transition::new(1, 1, Some(RequestState::Pending), RequestState::Cancelled)).unwrap();
        assert!(v
            .record(Transition::new(1, 1, Some(RequestState::Pending), RequestState::Cancelled))
            .is_err());
    }

    #[test]
    fn test_role_is_enforced() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        let g = ledger.writer(WriterRole::Gatekeeper);
        admit(&v, 1);
        v.record(Transition::new(1, 1, Some(RequestState::Pending), RequestState::Validating)).unwrap();

        assert!(g
            .record(Transition::new(1, 1, Some(RequestState::Validating), RequestState::WaitingOnDependencies))
            .is_err());
        assert_eq!(ledger.query(1).len(), 2);
    }

    #[test]
    fn test_retry_requires_new_attempt() {
        use RequestState::*;
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        let g = ledger.writer(WriterRole::Gatekeeper);

        admit(&v, 1);
        walk_to_testing(&v, &g, 1, 1);
        g.record(Transition::new(1, 1, Some(Testing), GateFailed).reason("tests failed")).unwrap();

        assert!(v.record(Transition::new(1, 1, Some(GateFailed), Pending)).is_err());
        v.record(Transition::new(1, 2, Some(GateFailed), Pending).base(0)).unwrap();
        assert_eq!(ledger.state_of(1), Some((Pending, 2)));
    }

    #[test]
    fn test_single_committing_holder() {
        use RequestState::*;
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        let g = ledger.writer(WriterRole::Gatekeeper);

        for id in [1, 2] {
            admit(&v, id);
            walk_to_testing(&v, &g, id, 1);
        }

        g.record(Transition::new(1, 1, Some(Testing), Committing).commit(1, "0")).unwrap();
        assert_eq!(ledger.committing(), Some(1));
        assert!(g.record(Transition::new(2, 1, Some(Testing), Committing).commit(2, "0")).is_err());

        g.record(Transition::new(1, 1, Some(Committing), Completed).commit(1, "1")).unwrap();
        assert_eq!(ledger.committing(), None);
        g.record(Transition::new(2, 1, Some(Testing), Committing).commit(2, "1")).unwrap();
    }

    #[test]
    fn test_persist_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = StatusLedger::open(&path, false).unwrap();
            let v = ledger.writer(WriterRole::Validator);
            admit(&v, 1);
            admit(&v, 2);
            v.record(Transition::new(2, 1, Some(RequestState::Pending), RequestState::Rejected).reason("bad"))
                .unwrap();
        }

        let ledger = StatusLedger::open(&path, false).unwrap();
        assert_eq!(ledger.last_seq(), 3);
        assert_eq!(ledger.state_of(2), Some((RequestState::Rejected, 1)));
        assert_eq!(ledger.latest(2).unwrap().reason, "bad");

        // Appends continue the sequence.
        let v = ledger.writer(WriterRole::Validator);
        let entry = v
            .record(Transition::new(1, 1, Some(RequestState::Pending), RequestState::Validating))
            .unwrap();
        assert_eq!(entry.seq, 4);
    }

    #[test]
    fn test_latest_entries_and_entries_after() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        admit(&v, 2);
        admit(&v, 1);
        v.record(Transition::new(2, 1, Some(RequestState::Pending), RequestState::Validating)).unwrap();

        let latest = ledger.latest_entries();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].request_id, 1);
        assert_eq!(latest[1].to, RequestState::Validating);

        assert_eq!(ledger.entries_after(1).len(), 2);
        assert!(ledger.entries_after(10).is_empty());
    }
}
