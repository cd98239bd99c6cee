//! Request log
//!
//! Every admitted request is appended to `requests.jsonl` before it is
//! acknowledged. Requests are immutable, so the log is never rewritten.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::JsonLines;
use crate::types::{Request, RequestDraft, RequestId};

struct Inner {
    requests: BTreeMap<RequestId, Arc<Request>>,
    next_id: RequestId,
    log: Option<JsonLines>,
}

/// Durable store of submitted requests
pub struct RequestStore {
    inner: Mutex<Inner>,
}

impl RequestStore {
    pub fn in_memory() -> Self {
        Self::from_parts(Vec::new(), None)
    }

    /// Open the request log, replaying recorded requests
    pub fn open(path: &Path, fsync: bool) -> Result<Self> {
        let requests: Vec<Request> = JsonLines::read_all(path)?;
        let log = JsonLines::open(path, fsync)?;
        tracing::info!(path = %path.display(), requests = requests.len(), "Request log opened");
        Ok(Self::from_parts(requests, Some(log)))
    }

    fn from_parts(requests: Vec<Request>, log: Option<JsonLines>) -> Self {
        let requests: BTreeMap<RequestId, Arc<Request>> =
            requests.into_iter().map(|r| (r.id, Arc::new(r))).collect();
        let next_id = requests.keys().next_back().map(|id| id + 1).unwrap_or(1);
        Self {
            inner: Mutex::new(Inner {
                requests,
                next_id,
                log,
            }),
        }
    }

    /// Assign the next id and persist the request
    pub fn insert(&self, draft: RequestDraft) -> Result<Arc<Request>> {
        let mut inner = self.inner.lock();
        let request = Request::new(inner.next_id, draft);
        if let Some(log) = inner.log.as_mut() {
            log.append(&request)?;
        }
        inner.next_id += 1;

        let request = Arc::new(request);
        inner.requests.insert(request.id, Arc::clone(&request));
        Ok(request)
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<Request>> {
        self.inner.lock().requests.get(&id).cloned()
    }

    /// Every request, in id order
    pub fn all(&self) -> Vec<Arc<Request>> {
        self.inner.lock().requests.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn next_id(&self) -> RequestId {
        self.inner.lock().next_id
    }
}
