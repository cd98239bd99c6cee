//! Request mailbox
//!
//! One inbox per coordinator. Each submitter has its own FIFO queue and the
//! queues are served round-robin, so a busy submitter delays another by at
//! most one item per rotation. Duplicate detection keys on submitter and
//! content hash within a time window.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::types::{RequestId, WorkerId};

// ─────────────────────────────────────────────────────────────────
// Fair Queue
// ─────────────────────────────────────────────────────────────────

struct Queues<T> {
    by_submitter: HashMap<WorkerId, VecDeque<T>>,
    /// Submitters with queued items, in service order
    rotation: VecDeque<WorkerId>,
    len: usize,
}

/// Per-submitter FIFO queues served round-robin
pub struct Mailbox<T> {
    queues: Mutex<Queues<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(Queues {
                by_submitter: HashMap::new(),
                rotation: VecDeque::new(),
                len: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue behind the submitter's earlier items
    pub fn push(&self, submitter: &str, item: T) -> Result<()> {
        {
            let mut q = self.queues.lock();
            if q.len >= self.capacity {
                return Err(Error::MailboxFull {
                    capacity: self.capacity,
                });
            }

            let queue = q.by_submitter.entry(submitter.to_string()).or_default();
            let was_empty = queue.is_empty();
            queue.push_back(item);
            if was_empty {
                q.rotation.push_back(submitter.to_string());
            }
            q.len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next item in round-robin order, if any
    pub fn try_pop(&self) -> Option<T> {
        let mut q = self.queues.lock();
        let submitter = q.rotation.pop_front()?;

        let (item, more) = match q.by_submitter.get_mut(&submitter) {
            Some(queue) => (queue.pop_front(), !queue.is_empty()),
            None => (None, false),
        };
        if more {
            q.rotation.push_back(submitter);
        } else {
            q.by_submitter.remove(&submitter);
        }
        if item.is_some() {
            q.len -= 1;
        }
        item
    }

    /// Wait for the next item
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────
// Duplicate Detection
// ─────────────────────────────────────────────────────────────────

/// Recently seen (submitter, content hash) pairs
pub struct DedupIndex {
    window: Duration,
    seen: HashMap<(WorkerId, String), (RequestId, DateTime<Utc>)>,
}

impl DedupIndex {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000)),
            seen: HashMap::new(),
        }
    }

    /// Request id previously submitted with this content inside the window
    pub fn lookup(&self, submitter: &str, hash: &str, now: DateTime<Utc>) -> Option<RequestId> {
        self.seen
            .get(&(submitter.to_string(), hash.to_string()))
            .filter(|(_, at)| now - *at < self.window)
            .map(|(id, _)| *id)
    }

    /// Remember a submission (or refresh it on retry)
    pub fn record(&mut self, submitter: &str, hash: &str, id: RequestId, at: DateTime<Utc>) {
        self.seen.insert((submitter.to_string(), hash.to_string()), (id, at));
    }

    /// Drop entries older than the window
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.seen.retain(|_, (_, at)| now - *at < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
