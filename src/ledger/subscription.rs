//! Ledger subscriptions
//!
//! Live entries arrive over a broadcast channel. A subscriber that falls
//! behind the channel is caught up from the ledger itself, so a subscription
//! never skips an entry.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use super::{LedgerEntry, StatusLedger};

type Predicate = Box<dyn Fn(&LedgerEntry) -> bool + Send + Sync>;

/// Ordered stream of ledger entries matching a predicate
pub struct LedgerSubscription {
    ledger: Arc<StatusLedger>,
    rx: broadcast::Receiver<LedgerEntry>,
    predicate: Predicate,
    /// Highest seq handed out or skipped
    last_seq: u64,
    backlog: VecDeque<LedgerEntry>,
}

impl LedgerSubscription {
    pub(super) fn new(
        ledger: Arc<StatusLedger>,
        rx: broadcast::Receiver<LedgerEntry>,
        after: u64,
        predicate: Predicate,
    ) -> Self {
        let mut sub = Self {
            ledger,
            rx,
            predicate,
            last_seq: after,
            backlog: VecDeque::new(),
        };
        sub.catch_up();
        sub
    }

    /// Load everything recorded after `last_seq` into the backlog
    fn catch_up(&mut self) {
        for entry in self.ledger.entries_after(self.last_seq) {
            self.last_seq = entry.seq;
            if (self.predicate)(&entry) {
                self.backlog.push_back(entry);
            }
        }
    }

    /// Next matching entry; `None` once the ledger is gone
    pub async fn next(&mut self) -> Option<LedgerEntry> {
        loop {
            if let Some(entry) = self.backlog.pop_front() {
                return Some(entry);
            }

            match self.rx.recv().await {
                Ok(entry) => {
                    if entry.seq <= self.last_seq {
                        continue;
                    }
                    if entry.seq > self.last_seq + 1 {
                        self.catch_up();
                        continue;
                    }
                    self.last_seq = entry.seq;
                    if (self.predicate)(&entry) {
                        return Some(entry);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, last_seq = self.last_seq, "Ledger subscriber lagged, catching up");
                    self.catch_up();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Highest ledger seq this subscription has seen
    pub fn position(&self) -> u64 {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Transition, WriterRole};
    use crate::types::RequestState;

    #[tokio::test]
    async fn test_subscribe_filters_by_predicate() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        let mut sub = ledger.subscribe(|e| e.request_id == 2);

        v.record(Transition::new(1, 1, None, RequestState::Pending)).unwrap();
        v.record(Transition::new(2, 1, None, RequestState::Pending)).unwrap();

        let entry = sub.next().await.unwrap();
        assert_eq!(entry.request_id, 2);
        assert_eq!(sub.position(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_after_replays_history() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        v.record(Transition::new(1, 1, None, RequestState::Pending)).unwrap();
        v.record(Transition::new(1, 1, Some(RequestState::Pending), RequestState::Validating))
            .unwrap();

        let mut sub = ledger.subscribe_after(0, |e| e.request_id == 1);
        v.record(Transition::new(1, 1, Some(RequestState::Validating), RequestState::Rejected))
            .unwrap();

        let states: Vec<_> = [
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.to)
        .collect();
        assert_eq!(
            states,
            vec![RequestState::Pending, RequestState::Validating, RequestState::Rejected]
        );
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_every_entry() {
        let ledger = StatusLedger::in_memory();
        let v = ledger.writer(WriterRole::Validator);
        let mut sub = ledger.subscribe(|_| true);

        // More entries than the channel holds.
        for id in 1..=1500u64 {
            v.record(Transition::new(id, 1, None, RequestState::Pending)).unwrap();
        }

        for expected in 1..=1500u64 {
            let entry = sub.next().await.unwrap();
            assert_eq!(entry.seq, expected);
        }
    }
}
