//! Dependency graph scheduler
//!
//! Holds admitted requests until every declared dependency is COMPLETED in
//! the ledger. Cycles are refused when a request is registered. Evaluation
//! is driven by ledger events; a periodic sweep only enforces the wait
//! timeout.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ledger::StatusLedger;
use crate::types::{RequestId, RequestState};

// ─────────────────────────────────────────────────────────────────
// Dependency Graph
// ─────────────────────────────────────────────────────────────────

/// Declared dependencies of every registered request
#[derive(Debug, Default)]
pub struct DependencyGraph {
    deps: HashMap<RequestId, BTreeSet<RequestId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cycle that adding `id -> deps` would close, as a path starting and
    /// ending at `id`
    pub fn find_cycle(&self, id: RequestId, deps: &BTreeSet<RequestId>) -> Option<Vec<RequestId>> {
        if deps.contains(&id) {
            return Some(vec![id, id]);
        }

        // DFS from each dependency looking for a path back to `id`.
        let mut visited = HashSet::new();
        for &start in deps {
            let mut stack = vec![(start, vec![id, start])];
            while let Some((current, path)) = stack.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if let Some(next) = self.deps.get(&current) {
                    for &dep in next {
                        let mut p = path.clone();
                        p.push(dep);
                        if dep == id {
                            return Some(p);
                        }
                        stack.push((dep, p));
                    }
                }
            }
        }
        None
    }

    /// Add a request's edges, refusing cycles
    pub fn insert(&mut self, id: RequestId, deps: &BTreeSet<RequestId>) -> Result<()> {
        if let Some(cycle) = self.find_cycle(id, deps) {
            return Err(Error::CyclicDependency { cycle });
        }
        self.deps.insert(id, deps.clone());
        Ok(())
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.deps.contains_key(&id)
    }

    /// Every request `id` depends on, directly or not
    pub fn transitive_dependencies(&self, id: RequestId) -> BTreeSet<RequestId> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<RequestId> = self
            .deps
            .get(&id)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();

        while let Some(current) = stack.pop() {
            if out.insert(current) {
                if let Some(next) = self.deps.get(&current) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Waiter {
    attempt: u32,
    since: Instant,
}

/// Result of one evaluation pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// All dependencies COMPLETED: (id, attempt)
    pub runnable: Vec<(RequestId, u32)>,
    /// A dependency failed permanently: (id, attempt, reason)
    pub blocked: Vec<(RequestId, u32, String)>,
    /// Waited longer than the dependency timeout: (id, attempt)
    pub timed_out: Vec<(RequestId, u32)>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty() && self.blocked.is_empty() && self.timed_out.is_empty()
    }
}

enum DepStatus {
    Done,
    Waiting,
    Failed(String),
}

/// Tracks requests in WAITING_ON_DEPENDENCIES
pub struct Scheduler {
    graph: DependencyGraph,
    waiting: BTreeMap<RequestId, Waiter>,
    timeout: Duration,
    max_attempts: u32,
}

impl Scheduler {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            graph: DependencyGraph::new(),
            waiting: BTreeMap::new(),
            timeout,
            max_attempts,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Add the request's dependency edges (idempotent for retries)
    pub fn register(&mut self, id: RequestId, deps: &BTreeSet<RequestId>) -> Result<()> {
        if self.graph.contains(id) {
            return Ok(());
        }
        self.graph.insert(id, deps)
    }

    /// Start waiting on dependencies
    pub fn wait(&mut self, id: RequestId, attempt: u32, since: Instant) {
        self.waiting.insert(id, Waiter { attempt, since });
    }

    /// Stop tracking a request (cancelled or otherwise resolved)
    pub fn forget(&mut self, id: RequestId) -> bool {
        self.waiting.remove(&id).is_some()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_waiting(&self, id: RequestId) -> bool {
        self.waiting.contains_key(&id)
    }

    /// True only when every dependency's latest state is COMPLETED
    pub fn is_runnable(&self, id: RequestId, ledger: &StatusLedger) -> bool {
        self.graph
            .deps
            .get(&id)
            .map(|deps| deps.iter().all(|d| matches!(self.dep_status(*d, ledger), DepStatus::Done)))
            .unwrap_or(true)
    }

    fn dep_status(&self, dep: RequestId, ledger: &StatusLedger) -> DepStatus {
        match ledger.state_of(dep) {
            Some((RequestState::Completed, _)) => DepStatus::Done,
            Some((state, _)) if state.is_permanent_failure() => {
                DepStatus::Failed(format!("dependency #{} is {}", dep, state))
            }
            Some((state, attempt)) if state.is_retryable_failure() && attempt >= self.max_attempts => {
                DepStatus::Failed(format!(
                    "dependency #{} is {} after {} attempts",
                    dep, state, attempt
                ))
            }
            Some(_) => DepStatus::Waiting,
            None => DepStatus::Failed(format!("dependency #{} has no ledger trail", dep)),
        }
    }

    /// Resolve every waiter that can make progress. Resolved requests are
    /// no longer tracked.
    pub fn evaluate(&mut self, ledger: &StatusLedger, now: Instant) -> Evaluation {
        let mut eval = Evaluation::default();
        let mut resolved = Vec::new();

        for (&id, waiter) in &self.waiting {
            match ledger.state_of(id) {
                Some((RequestState::WaitingOnDependencies, attempt)) if attempt == waiter.attempt => {}
                // Cancelled or otherwise moved on.
                _ => {
                    resolved.push(id);
                    continue;
                }
            }

            let deps = self.graph.deps.get(&id).cloned().unwrap_or_default();
            let mut failed = None;
            let mut all_done = true;
            for dep in deps {
                match self.dep_status(dep, ledger) {
                    DepStatus::Done => {}
                    DepStatus::Waiting => all_done = false,
                    DepStatus::Failed(reason) => {
                        failed = Some(reason);
                        break;
                    }
                }
            }

            if let Some(reason) = failed {
                eval.blocked.push((id, waiter.attempt, reason));
                resolved.push(id);
            } else if all_done {
                eval.runnable.push((id, waiter.attempt));
                resolved.push(id);
            } else if now.duration_since(waiter.since) >= self.timeout {
                eval.timed_out.push((id, waiter.attempt));
                resolved.push(id);
            }
        }

        for id in resolved {
            self.waiting.remove(&id);
        }
        eval
    }
}
