//! Coordinator
//!
//! Owns every component of the gating protocol and drives requests through
//! it:
//!
//! ```text
//! submit ──► mailbox ──► dispatcher (validate) ──► scheduler ──► pipeline
//!                                                                (gates ──► executor)
//! ```
//!
//! The dispatcher admits one request at a time in arrival order. Admitted
//! requests wait in the scheduler until their dependencies complete, then
//! run their gates concurrently. Writes are serialized by the executor.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::executor::{CommitExecutor, CommitOutcome};
use super::store::RequestStore;
use super::tracker::{Phase, RequestTracker, Verdict};
use crate::config::{GatekeeperConfig, RepositoryBackend};
use crate::error::{Error, Result};
use crate::gates::{GateRunner, Worktrees};
use crate::ledger::{LedgerEntry, LedgerWriter, StatusLedger, Transition, WriterRole};
use crate::logging;
use crate::mailbox::{DedupIndex, Mailbox};
use crate::protocol::{CancelOutcome, StatusReport, SubmitOutcome};
use crate::registry::{
    Approval, ApprovalGrant, ApprovalStore, ResourceRegistry, SharedApprovals, SharedRegistry,
};
use crate::repository::{self, RepoSnapshot, Repository};
use crate::scheduler::Scheduler;
use crate::types::{
    all_passed, QualityGateResult, Request, RequestDraft, RequestId, RequestState, WorkerId,
};
use crate::validator::Validator;

// ─────────────────────────────────────────────────────────────────
// Components
// ─────────────────────────────────────────────────────────────────

/// Storage and backends a coordinator is assembled from
pub struct Components {
    pub ledger: Arc<StatusLedger>,
    pub store: RequestStore,
    pub approvals: ApprovalStore,
    pub registry: ResourceRegistry,
    pub repository: Box<dyn Repository>,
}

impl Components {
    /// Open the configured storage: the on-disk logs when
    /// `storage.persist` is set, in-memory stores otherwise
    pub fn open(config: &GatekeeperConfig) -> Result<Self> {
        let storage = &config.storage;
        let (ledger, store, approvals, journal) = if storage.persist {
            (
                StatusLedger::open(&config.ledger_path(), storage.fsync)?,
                RequestStore::open(&config.requests_path(), storage.fsync)?,
                ApprovalStore::open(&config.approvals_path(), storage.fsync)?,
                Some(config.repository_journal_path()),
            )
        } else {
            (StatusLedger::in_memory(), RequestStore::in_memory(), ApprovalStore::in_memory(), None)
        };

        Ok(Self {
            ledger,
            store,
            approvals,
            registry: ResourceRegistry::load(&config.registry_path())?,
            repository: repository::open(&config.repository, journal.as_deref(), storage.fsync)?,
        })
    }

    /// Volatile stores around the given registry and repository
    pub fn in_memory(registry: ResourceRegistry, repository: Box<dyn Repository>) -> Self {
        Self {
            ledger: StatusLedger::in_memory(),
            store: RequestStore::in_memory(),
            approvals: ApprovalStore::in_memory(),
            registry,
            repository,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// The gatekeeping coordinator
pub struct Coordinator {
    pub(super) config: GatekeeperConfig,
    pub(super) ledger: Arc<StatusLedger>,
    /// Writer for admission decisions
    pub(super) admission: LedgerWriter,
    /// Writer for gating, commit and scheduler decisions
    pub(super) gatekeeper: LedgerWriter,
    pub(super) store: RequestStore,
    pub(super) tracker: Arc<RequestTracker>,
    pub(super) mailbox: Mailbox<RequestId>,
    pub(super) dedup: Mutex<DedupIndex>,
    pub(super) validator: Validator,
    pub(super) scheduler: Mutex<Scheduler>,
    pub(super) gates: GateRunner,
    pub(super) executor: CommitExecutor,
    pub(super) registry: SharedRegistry,
    pub(super) approvals: SharedApprovals,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Open storage and the repository as configured
    pub async fn open(config: GatekeeperConfig) -> Result<Arc<Self>> {
        let components = Components::open(&config)?;
        let mut gates = GateRunner::from_settings(
            &config.gates,
            config.gate_concurrency(),
            PathBuf::from(&config.repository.path),
        )?;
        if config.repository.backend == RepositoryBackend::Git {
            gates = gates.with_worktrees(Worktrees::new(&config.repository, config.worktree_dir()));
        }
        Self::new(config, components, gates).await
    }

    pub async fn new(
        config: GatekeeperConfig,
        components: Components,
        gates: GateRunner,
    ) -> Result<Arc<Self>> {
        let Components {
            ledger,
            store,
            approvals,
            registry,
            repository,
        } = components;

        let registry: SharedRegistry = Arc::new(RwLock::new(registry));
        let approvals: SharedApprovals = Arc::new(RwLock::new(approvals));
        let tracker = Arc::new(RequestTracker::new());

        let executor = CommitExecutor::new(
            repository,
            ledger.writer(WriterRole::Gatekeeper),
            Arc::clone(&registry),
            Arc::clone(&tracker),
        )
        .await?;

        let mut validator = Validator::new(
            config.validation.clone(),
            config.repository.main_branch.clone(),
            Arc::clone(&registry),
            Arc::clone(&approvals),
            Arc::clone(&ledger),
        );
        if config.repository.backend == RepositoryBackend::Git {
            validator = validator.with_diff_root(&config.repository.path);
        }

        let scheduler = Scheduler::new(
            Duration::from_secs(config.scheduler.dependency_timeout_secs),
            config.gates.max_attempts,
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            admission: ledger.writer(WriterRole::Validator),
            gatekeeper: ledger.writer(WriterRole::Gatekeeper),
            mailbox: Mailbox::new(config.mailbox.capacity),
            dedup: Mutex::new(DedupIndex::new(config.mailbox.dedup_window_secs)),
            scheduler: Mutex::new(scheduler),
            config,
            ledger,
            store,
            tracker,
            validator,
            gates,
            executor,
            registry,
            approvals,
            wake: Notify::new(),
            shutdown,
        }))
    }

    /// Recover interrupted requests, then start the dispatcher and the
    /// scheduler loop
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let report = self.recover().await?;
        info!(
            requests = self.store.len(),
            requeued = report.requeued,
            waiting = report.resumed_waiting,
            interrupted = report.interrupted_testing,
            rolled_back = report.rolled_back,
            ledger_seq = self.ledger.last_seq(),
            "Coordinator started"
        );

        let dispatcher = tokio::spawn(Arc::clone(self).dispatch_loop());
        let scheduler = tokio::spawn(Arc::clone(self).schedule_loop());
        Ok(vec![dispatcher, scheduler])
    }

    /// Stop the background loops. Running pipelines finish on their own.
    pub fn stop(&self) {
        info!(
            in_flight = self.tracker.len(),
            completed = self.tracker.total_completed(),
            failed = self.tracker.total_failed(),
            "Stopping coordinator"
        );
        self.shutdown.send_replace(true);
    }

    pub fn ledger(&self) -> &Arc<StatusLedger> {
        &self.ledger
    }

    // ─────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────

    /// Submit a request and wait for its admission verdict.
    ///
    /// An identical submission inside the dedup window returns the
    /// existing request, or starts its next attempt when the last one
    /// ended in GATE_FAILED or ROLLED_BACK.
    pub async fn submit(&self, draft: RequestDraft) -> Result<SubmitOutcome> {
        let hash = draft.content_hash();
        let submitter = draft.submitter.clone();
        let now = Utc::now();

        let (id, attempt, verdict) = {
            let mut dedup = self.dedup.lock();
            dedup.prune(now);

            let existing = dedup.lookup(&submitter, &hash, now);
            if let Some(existing) = existing {
                let (state, attempt) = self
                    .ledger
                    .state_of(existing)
                    .ok_or(Error::MissingLedgerTrail { request_id: existing })?;
                if !state.is_retryable_failure() {
                    info!(request_id = existing, %state, submitter = %submitter, "Duplicate submission");
                    return Ok(SubmitOutcome::Duplicate {
                        request_id: existing,
                        state,
                        attempt,
                    });
                }
                if attempt >= self.config.gates.max_attempts {
                    return Err(Error::AttemptsExhausted {
                        request_id: existing,
                        attempts: attempt,
                    });
                }
            }

            if self.mailbox.len() >= self.config.mailbox.capacity {
                return Err(Error::MailboxFull {
                    capacity: self.config.mailbox.capacity,
                });
            }

            let (request, attempt, from, reason) = match existing {
                Some(existing) => {
                    let request = self
                        .store
                        .get(existing)
                        .ok_or(Error::RequestNotFound { request_id: existing })?;
                    let (state, attempt) = self
                        .ledger
                        .state_of(existing)
                        .ok_or(Error::MissingLedgerTrail { request_id: existing })?;
                    (request, attempt + 1, Some(state), format!("resubmitted after {}", state))
                }
                None => (self.store.insert(draft)?, 1, None, "submitted".to_string()),
            };

            self.admission.record(
                Transition::new(request.id, attempt, from, RequestState::Pending)
                    .base(self.executor.completed_seq())
                    .reason(reason),
            )?;

            let id = request.id;
            let verdict = self.tracker.admit(request, attempt);
            dedup.record(&submitter, &hash, id, now);
            self.mailbox.push(&submitter, id)?;
            (id, attempt, verdict)
        };

        info!(request_id = id, attempt, submitter = %submitter, "Request queued");

        let timeout = Duration::from_millis(self.config.validation.timeout_ms);
        match tokio::time::timeout(timeout, verdict).await {
            Ok(Ok(Verdict::Admitted)) if attempt > 1 => Ok(SubmitOutcome::Retried {
                request_id: id,
                attempt,
            }),
            Ok(Ok(Verdict::Admitted)) => Ok(SubmitOutcome::Accepted { request_id: id }),
            Ok(Ok(Verdict::Rejected(e))) => Ok(SubmitOutcome::Rejected {
                request_id: id,
                code: e.code().as_str(),
                reason: e.to_string(),
            }),
            Ok(Ok(Verdict::Cancelled)) => Ok(SubmitOutcome::Cancelled { request_id: id }),
            Ok(Err(_)) => Err(Error::Internal(format!(
                "admission of request #{} ended without a verdict",
                id
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "request #{} was not validated within {}ms; it remains queued",
                id, self.config.validation.timeout_ms
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────

    async fn dispatch_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                id = self.mailbox.pop() => self.dispatch(id),
                _ = shutdown.changed() => break,
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Validate one queued request
    fn dispatch(&self, id: RequestId) {
        let Some((request, attempt)) = self.tracker.get(id) else {
            debug!(request_id = id, "Dequeued request no longer tracked");
            return;
        };

        match self.ledger.state_of(id) {
            Some((RequestState::Pending, a)) if a == attempt => {
                let started = self.admission.record(Transition::new(
                    id,
                    attempt,
                    Some(RequestState::Pending),
                    RequestState::Validating,
                ));
                if let Err(e) = started {
                    debug!(request_id = id, error = %e, "Validation not started");
                    return;
                }
            }
            // Recovered mid-validation
            Some((RequestState::Validating, a)) if a == attempt => {}
            other => {
                debug!(request_id = id, state = ?other, "Dequeued request is no longer pending");
                return;
            }
        }
        self.tracker.set_phase(id, Phase::Validating);

        let exempt = {
            let scheduler = self.scheduler.lock();
            let mut exempt = BTreeSet::new();
            for dep in request.depends_on() {
                exempt.insert(*dep);
                exempt.extend(scheduler.graph().transitive_dependencies(*dep));
            }
            exempt
        };
        let in_flight = self.tracker.in_flight();

        let admitted = match self.validator.validate(&request, &in_flight, &exempt) {
            Ok(admitted) => admitted,
            Err(e) => return self.reject(&request, attempt, e),
        };

        {
            let mut scheduler = self.scheduler.lock();
            if let Err(e) = scheduler.register(id, request.depends_on()) {
                drop(scheduler);
                return self.reject(&request, attempt, e);
            }

            let waiting = self.admission.record(
                Transition::new(
                    id,
                    attempt,
                    Some(RequestState::Validating),
                    RequestState::WaitingOnDependencies,
                )
                .reason(admitted.summary()),
            );
            if let Err(e) = waiting {
                debug!(request_id = id, error = %e, "Admission overtaken");
                return;
            }
            scheduler.wait(id, attempt, Instant::now());
        }

        self.tracker.set_phase(id, Phase::Waiting);
        self.tracker.resolve(id, Verdict::Admitted);
        info!(request_id = id, attempt, grants = admitted.grants.len(), "Request admitted");
        self.wake.notify_one();
    }

    fn reject(&self, request: &Request, attempt: u32, err: Error) {
        warn!(request_id = request.id, submitter = %request.submitter(), error = %err, "Request rejected");
        let recorded = self.admission.record(
            Transition::new(
                request.id,
                attempt,
                Some(RequestState::Validating),
                RequestState::Rejected,
            )
            .reason(err.to_string()),
        );
        if let Err(e) = recorded {
            debug!(request_id = request.id, error = %e, "Rejection not recorded");
        }
        self.tracker.resolve(request.id, Verdict::Rejected(err));
        self.tracker.finish(request.id, false);
    }

    // ─────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────

    async fn schedule_loop(self: Arc<Self>) {
        let mut events = self.ledger.subscribe(|e: &LedgerEntry| {
            e.to.is_terminal() || e.to == RequestState::WaitingOnDependencies
        });
        let mut tick = tokio::time::interval(Duration::from_millis(
            self.config.scheduler.tick_interval_ms.max(1),
        ));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            self.evaluate();
            tokio::select! {
                entry = events.next() => {
                    if entry.is_none() {
                        break;
                    }
                }
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Scheduler loop stopped");
    }

    /// One scheduling pass: start runnable requests, fail blocked and
    /// timed-out ones
    fn evaluate(self: &Arc<Self>) {
        let evaluation = self.scheduler.lock().evaluate(&self.ledger, Instant::now());
        if evaluation.is_empty() {
            return;
        }

        for (id, attempt) in evaluation.runnable {
            let this = Arc::clone(self);
            tokio::spawn(this.run_attempt(id, attempt).instrument(logging::request_span(id, attempt)));
        }

        for (id, attempt, reason) in evaluation.blocked {
            warn!(request_id = id, attempt, %reason, "Dependency failed");
            self.record_or_log(
                Transition::new(
                    id,
                    attempt,
                    Some(RequestState::WaitingOnDependencies),
                    RequestState::Rejected,
                )
                .reason(reason),
            );
            self.tracker.finish(id, false);
        }

        for (id, attempt) in evaluation.timed_out {
            warn!(request_id = id, attempt, "Dependency wait timed out");
            self.record_or_log(
                Transition::new(
                    id,
                    attempt,
                    Some(RequestState::WaitingOnDependencies),
                    RequestState::GateFailed,
                )
                .reason(format!(
                    "Timeout: dependencies not completed within {}s",
                    self.config.scheduler.dependency_timeout_secs
                )),
            );
            self.tracker.finish(id, false);
        }
    }

    fn record_or_log(&self, transition: Transition) {
        let id = transition.request_id;
        if let Err(e) = self.gatekeeper.record(transition) {
            debug!(request_id = id, error = %e, "Transition not recorded");
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Gating and Commit
    // ─────────────────────────────────────────────────────────────

    /// Gate and commit one attempt whose dependencies completed
    async fn run_attempt(self: Arc<Self>, id: RequestId, attempt: u32) {
        let Some((request, tracked)) = self.tracker.get(id) else {
            return;
        };
        if tracked != attempt {
            return;
        }

        let started = self.gatekeeper.record(
            Transition::new(
                id,
                attempt,
                Some(RequestState::WaitingOnDependencies),
                RequestState::Testing,
            )
            .reason("dependencies completed"),
        );
        if let Err(e) = started {
            debug!(request_id = id, error = %e, "Gating not started");
            return;
        }
        self.tracker.set_phase(id, Phase::Testing);
        info!(request_id = id, attempt, kind = %request.kind(), "Gating started");

        let results = self.gates.run(&request, attempt).await;
        let required = self.gates.required_checks(request.kind());

        if let Some(by) = self.tracker.cancel_requested(id) {
            return self.discard(id, attempt, &by, results);
        }

        if !all_passed(&results, &required, attempt) {
            let failures: Vec<String> = results
                .iter()
                .filter_map(QualityGateResult::to_error)
                .map(|e| e.to_string())
                .collect();
            let mut reason = if failures.is_empty() {
                "required checks did not report a pass".to_string()
            } else {
                failures.join("; ")
            };
            if attempt >= self.config.gates.max_attempts {
                reason.push_str("; attempt ceiling reached");
            }
            warn!(request_id = id, attempt, %reason, "Gates failed");
            self.record_or_log(
                Transition::new(id, attempt, Some(RequestState::Testing), RequestState::GateFailed)
                    .gate_results(results)
                    .reason(reason),
            );
            self.tracker.finish(id, false);
            return;
        }

        let base_seq = self.base_seq(id, attempt);
        let exempt = self.scheduler.lock().graph().transitive_dependencies(id);

        match self
            .executor
            .commit(&request, attempt, base_seq, exempt, results.clone())
            .await
        {
            Ok(CommitOutcome::Completed(entry)) => {
                debug!(request_id = id, seq = entry.seq, "Attempt completed");
                self.tracker.finish(id, true);
            }
            Ok(CommitOutcome::RolledBack(entry)) => {
                debug!(request_id = id, seq = entry.seq, "Attempt rolled back");
                self.tracker.finish(id, false);
            }
            Ok(CommitOutcome::Cancelled) => {
                let by = self.tracker.cancel_requested(id).unwrap_or_default();
                self.discard(id, attempt, &by, results);
            }
            Err(e) => {
                error!(request_id = id, attempt, error = %e, "Commit failed");
                // Only applies when the write never started
                if let Some((RequestState::Testing, a)) = self.ledger.state_of(id) {
                    if a == attempt {
                        self.record_or_log(
                            Transition::new(
                                id,
                                attempt,
                                Some(RequestState::Testing),
                                RequestState::GateFailed,
                            )
                            .gate_results(results)
                            .reason(format!("commit not started: {}", e)),
                        );
                    }
                }
                self.tracker.finish(id, false);
            }
        }
    }

    /// Record a deferred cancellation at the end of gating
    fn discard(
        &self,
        id: RequestId,
        attempt: u32,
        by: &str,
        results: Vec<QualityGateResult>,
    ) {
        info!(request_id = id, attempt, by, "Attempt discarded after cancellation");
        self.record_or_log(
            Transition::new(id, attempt, Some(RequestState::Testing), RequestState::Cancelled)
                .gate_results(results)
                .reason(format!("cancelled by {} during testing; attempt {} discarded", by, attempt)),
        );
        self.tracker.finish(id, false);
    }

    /// Commit sequence the attempt was admitted against
    fn base_seq(&self, id: RequestId, attempt: u32) -> u64 {
        self.ledger
            .query(id)
            .iter()
            .rev()
            .find(|e| e.attempt == attempt && e.to == RequestState::Pending)
            .and_then(|e| e.base_seq)
            .unwrap_or(0)
    }

    // ─────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────

    /// Cancel a request on behalf of its submitter.
    ///
    /// Before gating the cancellation is immediate. During gating it is
    /// deferred to the end of the attempt. Once committing it is refused.
    pub fn cancel(&self, id: RequestId, by: &WorkerId) -> Result<CancelOutcome> {
        let request = self
            .store
            .get(id)
            .ok_or(Error::RequestNotFound { request_id: id })?;
        if request.submitter() != by {
            return Err(Error::CancelRefused {
                request_id: id,
                reason: format!("only the submitter ({}) may cancel it", request.submitter()),
            });
        }

        // The state may move between the read and the write
        for _ in 0..3 {
            let (state, attempt) = self
                .ledger
                .state_of(id)
                .ok_or(Error::MissingLedgerTrail { request_id: id })?;

            match state {
                s if s.is_cancellable() => {
                    let recorded = self.admission.record(
                        Transition::new(id, attempt, Some(s), RequestState::Cancelled)
                            .reason(format!("cancelled by {} while {}", by, s)),
                    );
                    match recorded {
                        Ok(_) => {
                            self.scheduler.lock().forget(id);
                            self.tracker.resolve(id, Verdict::Cancelled);
                            self.tracker.finish(id, false);
                            info!(request_id = id, by = %by, from = %s, "Request cancelled");
                            return Ok(CancelOutcome::Cancelled);
                        }
                        Err(Error::InvalidTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                RequestState::Testing => {
                    if self.tracker.request_cancel(id, by) {
                        info!(request_id = id, by = %by, "Cancellation deferred to end of gating");
                        return Ok(CancelOutcome::Deferred);
                    }
                    return Err(Error::CancelRefused {
                        request_id: id,
                        reason: "request is committing".to_string(),
                    });
                }
                RequestState::Committing => {
                    return Err(Error::CancelRefused {
                        request_id: id,
                        reason: "request is committing".to_string(),
                    })
                }
                other => {
                    return Err(Error::CancelRefused {
                        request_id: id,
                        reason: format!("request is already {}", other),
                    })
                }
            }
        }

        Err(Error::CancelRefused {
            request_id: id,
            reason: "request state kept changing; try again".to_string(),
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// Current state of a request, from the ledger
    pub fn status(&self, id: RequestId) -> Result<StatusReport> {
        let request = self
            .store
            .get(id)
            .ok_or(Error::RequestNotFound { request_id: id })?;
        let history = self.ledger.query(id);
        let latest = history
            .last()
            .ok_or(Error::MissingLedgerTrail { request_id: id })?;

        let attempt_entries = || history.iter().rev().filter(|e| e.attempt == latest.attempt);
        let gate_results = attempt_entries()
            .find(|e| !e.gate_results.is_empty())
            .map(|e| e.gate_results.clone())
            .unwrap_or_default();
        let commit = attempt_entries().find(|e| e.commit_seq.is_some());

        Ok(StatusReport {
            request_id: id,
            submitter: request.submitter().to_string(),
            kind: request.kind(),
            state: latest.to,
            attempt: latest.attempt,
            reason: latest.reason.clone(),
            commit_seq: commit.and_then(|e| e.commit_seq),
            revision: commit.and_then(|e| e.revision.clone()),
            updated_at: latest.timestamp,
            gate_results,
        })
    }

    /// Ledger history of one request, or the whole ledger
    pub fn ledger_entries(&self, id: Option<RequestId>) -> Result<Vec<LedgerEntry>> {
        match id {
            Some(id) => {
                let entries = self.ledger.query(id);
                if entries.is_empty() {
                    return Err(if self.store.get(id).is_some() {
                        Error::MissingLedgerTrail { request_id: id }
                    } else {
                        Error::RequestNotFound { request_id: id }
                    });
                }
                Ok(entries)
            }
            None => Ok(self.ledger.entries()),
        }
    }

    /// Published repository view
    pub fn snapshot(&self) -> Arc<RepoSnapshot> {
        self.executor.snapshot()
    }

    // ─────────────────────────────────────────────────────────────
    // Administration
    // ─────────────────────────────────────────────────────────────

    /// Record an owner's approval for another worker
    pub fn approve(&self, grant: ApprovalGrant) -> Result<Approval> {
        let registry = self.registry.read();
        let approval = self.approvals.write().grant(grant, &registry)?;
        info!(
            approval_id = approval.id,
            pattern = %approval.pattern,
            grantee = %approval.grantee,
            "Approval granted"
        );
        Ok(approval)
    }

    /// Reload the protected-resource registry from disk
    pub fn reload(&self) -> Result<usize> {
        let next = ResourceRegistry::load(&self.config.registry_path())?;
        let count = next.len();
        *self.registry.write() = next;
        info!(resources = count, "Registry reloaded");
        Ok(count)
    }

    pub fn registry(&self) -> ResourceRegistry {
        self.registry.read().clone()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictPolicy, StaticOutcome};
    use crate::gates::StaticCheck;
    use crate::registry::ProtectedResource;
    use crate::repository::{Fault, FaultInjector, MemoryRepository};
    use crate::types::RequestKind;

    struct Harness {
        coordinator: Arc<Coordinator>,
        faults: FaultInjector,
        _tasks: Vec<JoinHandle<()>>,
    }

    fn test_config() -> GatekeeperConfig {
        let mut config = GatekeeperConfig::default();
        config.storage.persist = false;
        config.validation.timeout_ms = 5_000;
        config.scheduler.tick_interval_ms = 20;
        config.scheduler.dependency_timeout_secs = 60;
        config.gates.max_attempts = 3;
        config
    }

    fn registry() -> ResourceRegistry {
        ResourceRegistry::from_resources(vec![ProtectedResource {
            pattern: "core".into(),
            owner: "alice".into(),
            description: None,
        }])
        .unwrap()
    }

    async fn harness_with(config: GatekeeperConfig, gates: GateRunner) -> Harness {
        let repo = MemoryRepository::new("main");
        let faults = repo.faults();
        let components = Components::in_memory(registry(), Box::new(repo));
        let coordinator = Coordinator::new(config, components, gates).await.unwrap();
        let tasks = coordinator.start().await.unwrap();
        Harness {
            coordinator,
            faults,
            _tasks: tasks,
        }
    }

    fn gates(outcome: StaticOutcome, delay_ms: u64) -> GateRunner {
        let check = StaticCheck::new(
            "tests",
            outcome,
            Duration::from_millis(delay_ms),
            Duration::from_secs(5),
        );
        GateRunner::new(4, true, PathBuf::from("."))
            .with_check(Arc::new(check))
            .with_plan(RequestKind::Commit, &["tests"])
    }

    fn passing_gates() -> GateRunner {
        gates(StaticOutcome::Pass, 0)
    }

    fn commit(submitter: &str, paths: &[&str]) -> RequestDraft {
        RequestDraft::new(submitter, RequestKind::Commit).with_paths(paths.iter().copied())
    }

    async fn wait_for(coordinator: &Coordinator, id: RequestId, state: RequestState) -> StatusReport {
        let mut sub = coordinator.ledger().subscribe_after(0, move |e| e.request_id == id && e.to == state);
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("state not reached")
            .expect("ledger closed");
        coordinator.status(id).unwrap()
    }

    fn states(coordinator: &Coordinator, id: RequestId) -> Vec<RequestState> {
        coordinator.ledger().query(id).iter().map(|e| e.to).collect()
    }

    #[tokio::test]
    async fn test_commit_flows_to_completed() {
        let h = harness_with(test_config(), passing_gates()).await;

        let outcome = h.coordinator.submit(commit("bob", &["docs/readme.md"])).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted { request_id: 1 });

        let status = wait_for(&h.coordinator, 1, RequestState::Completed).await;
        assert_eq!(status.commit_seq, Some(1));
        assert_eq!(status.gate_results.len(), 1);
        assert_eq!(
            states(&h.coordinator, 1),
            vec![
                RequestState::Pending,
                RequestState::Validating,
                RequestState::WaitingOnDependencies,
                RequestState::Testing,
                RequestState::Committing,
                RequestState::Completed,
            ]
        );
        assert!(h.coordinator.snapshot().files.contains_key("docs/readme.md"));
    }

    #[tokio::test]
    async fn test_ownership_violation_rejected() {
        let h = harness_with(test_config(), passing_gates()).await;

        let outcome = h.coordinator.submit(commit("bob", &["core/lib.rs"])).await.unwrap();
        match outcome {
            SubmitOutcome::Rejected { code, reason, .. } => {
                assert_eq!(code, "E401");
                assert!(reason.contains("OwnershipViolation"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.coordinator.status(1).unwrap().state, RequestState::Rejected);
    }

    #[tokio::test]
    async fn test_owner_may_commit_protected_path() {
        let h = harness_with(test_config(), passing_gates()).await;
        h.coordinator.submit(commit("alice", &["core/lib.rs"])).await.unwrap();
        wait_for(&h.coordinator, 1, RequestState::Completed).await;
    }

    #[tokio::test]
    async fn test_duplicate_returns_existing_request() {
        let h = harness_with(test_config(), passing_gates()).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        wait_for(&h.coordinator, 1, RequestState::Completed).await;

        let again = h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        assert_eq!(
            again,
            SubmitOutcome::Duplicate {
                request_id: 1,
                state: RequestState::Completed,
                attempt: 1
            }
        );
    }

    #[tokio::test]
    async fn test_dependency_orders_commits() {
        let gates = gates(StaticOutcome::Pass, 150);
        let h = harness_with(test_config(), gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        h.coordinator
            .submit(commit("bob", &["b.txt"]).with_dependencies([1]))
            .await
            .unwrap();

        let second = wait_for(&h.coordinator, 2, RequestState::Completed).await;
        let first = h.coordinator.status(1).unwrap();
        assert_eq!(first.state, RequestState::Completed);
        assert!(first.commit_seq < second.commit_seq);
    }

    #[tokio::test]
    async fn test_failed_dependency_rejects_dependent() {
        let gates = gates(StaticOutcome::Pass, 100);
        let h = harness_with(test_config(), gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        h.coordinator
            .submit(commit("bob", &["b.txt"]).with_dependencies([1]))
            .await
            .unwrap();
        h.coordinator.cancel(1, &"bob".to_string()).ok();

        let status = wait_for(&h.coordinator, 2, RequestState::Rejected).await;
        assert!(status.reason.contains("#1"));
    }

    #[tokio::test]
    async fn test_gate_failure_then_retry() {
        let gates = gates(StaticOutcome::Fail, 0);
        let h = harness_with(test_config(), gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        let failed = wait_for(&h.coordinator, 1, RequestState::GateFailed).await;
        assert_eq!(failed.gate_results.len(), 1);
        assert!(!failed.gate_results[0].passed);
        assert!(failed.reason.starts_with("GateFailure: check 'tests' failed"));

        let retry = h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        assert_eq!(
            retry,
            SubmitOutcome::Retried {
                request_id: 1,
                attempt: 2
            }
        );
    }

    #[tokio::test]
    async fn test_gate_timeout_then_new_attempt() {
        let check = StaticCheck::new("tests", StaticOutcome::Hang, Duration::ZERO, Duration::from_millis(50));
        let gates = GateRunner::new(4, true, PathBuf::from("."))
            .with_check(Arc::new(check))
            .with_plan(RequestKind::Commit, &["tests"]);
        let h = harness_with(test_config(), gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        let failed = wait_for(&h.coordinator, 1, RequestState::GateFailed).await;
        assert!(failed.reason.contains("Timeout: check 'tests' exceeded 50ms"));

        let retry = h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        assert_eq!(
            retry,
            SubmitOutcome::Retried {
                request_id: 1,
                attempt: 2
            }
        );
    }

    #[tokio::test]
    async fn test_attempt_ceiling() {
        let mut config = test_config();
        config.gates.max_attempts = 1;
        let gates = gates(StaticOutcome::Fail, 0);
        let h = harness_with(config, gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        let failed = wait_for(&h.coordinator, 1, RequestState::GateFailed).await;
        assert!(failed.reason.contains("attempt ceiling"));

        let err = h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap_err();
        assert!(matches!(err, Error::AttemptsExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let mut config = test_config();
        config.scheduler.dependency_timeout_secs = 600;
        let gates = gates(StaticOutcome::Pass, 300);
        let h = harness_with(config, gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        h.coordinator
            .submit(commit("bob", &["b.txt"]).with_dependencies([1]))
            .await
            .unwrap();

        let err = h.coordinator.cancel(2, &"carol".to_string()).unwrap_err();
        assert!(matches!(err, Error::CancelRefused { .. }));

        assert_eq!(h.coordinator.cancel(2, &"bob".to_string()).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(h.coordinator.status(2).unwrap().state, RequestState::Cancelled);

        wait_for(&h.coordinator, 1, RequestState::Completed).await;
        assert_eq!(h.coordinator.status(2).unwrap().state, RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_testing_is_deferred() {
        let gates = gates(StaticOutcome::Pass, 300);
        let h = harness_with(test_config(), gates).await;

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        wait_for(&h.coordinator, 1, RequestState::Testing).await;

        assert_eq!(h.coordinator.cancel(1, &"bob".to_string()).unwrap(), CancelOutcome::Deferred);
        let status = wait_for(&h.coordinator, 1, RequestState::Cancelled).await;
        assert_eq!(status.gate_results.len(), 1);
        assert!(!states(&h.coordinator, 1).contains(&RequestState::Committing));
    }

    #[tokio::test]
    async fn test_write_conflict_rolls_back() {
        let h = harness_with(test_config(), passing_gates()).await;
        h.faults.push(Fault::ConflictAfterWrite);

        h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        let status = wait_for(&h.coordinator, 1, RequestState::RolledBack).await;
        assert!(status.reason.contains("WriteConflict"));
        assert!(!h.coordinator.snapshot().files.contains_key("a.txt"));

        let retry = h.coordinator.submit(commit("bob", &["a.txt"])).await.unwrap();
        assert!(matches!(retry, SubmitOutcome::Retried { attempt: 2, .. }));
        wait_for(&h.coordinator, 1, RequestState::Completed).await;
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_one_path_race() {
        let h = harness_with(test_config(), gates(StaticOutcome::Pass, 150)).await;

        let (a, b) = tokio::join!(
            h.coordinator.submit(commit("bob", &["shared/x.rs"])),
            h.coordinator.submit(commit("carol", &["shared/x.rs"])),
        );
        let ids = [a.unwrap().request_id(), b.unwrap().request_id()];

        let settled = |state: RequestState| matches!(state, RequestState::Completed | RequestState::RolledBack);
        let finals = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let reports: Vec<StatusReport> = ids.iter().map(|id| h.coordinator.status(*id).unwrap()).collect();
                if reports.iter().all(|r| settled(r.state)) {
                    return reports;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("requests did not settle");

        let winner = finals.iter().find(|r| r.state == RequestState::Completed).expect("no winner");
        let loser = finals.iter().find(|r| r.state == RequestState::RolledBack).expect("no loser");
        assert!(loser.reason.contains("WriteConflict"), "{}", loser.reason);
        assert!(!states(&h.coordinator, loser.request_id).contains(&RequestState::Completed));

        let snapshot = h.coordinator.snapshot();
        assert_eq!(snapshot.commit_seq, 1);
        assert_eq!(snapshot.files["shared/x.rs"].request_id, winner.request_id);
    }

    #[tokio::test]
    async fn test_reject_early_conflict() {
        let mut config = test_config();
        config.validation.conflict_policy = ConflictPolicy::RejectEarly;
        let gates = gates(StaticOutcome::Pass, 300);
        let h = harness_with(config, gates).await;

        h.coordinator.submit(commit("bob", &["shared/x.rs"])).await.unwrap();
        let outcome = h.coordinator.submit(commit("carol", &["shared/x.rs"])).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Rejected { ref code, .. } if code == "E403"));
    }

    #[tokio::test]
    async fn test_transfer_ownership_updates_registry() {
        let gates = passing_gates().with_plan(RequestKind::TransferOwnership, &[]);
        let h = harness_with(test_config(), gates).await;

        let draft = RequestDraft::new("alice", RequestKind::TransferOwnership)
            .with_paths(["core"])
            .with_new_owner("bob");
        h.coordinator.submit(draft).await.unwrap();
        wait_for(&h.coordinator, 1, RequestState::Completed).await;

        assert_eq!(h.coordinator.registry().get("core").unwrap().owner, "bob");
        h.coordinator.submit(commit("bob", &["core/lib.rs"])).await.unwrap();
        wait_for(&h.coordinator, 2, RequestState::Completed).await;
    }

    #[tokio::test]
    async fn test_status_of_unknown_request() {
        let h = harness_with(test_config(), passing_gates()).await;
        assert!(matches!(
            h.coordinator.status(42),
            Err(Error::RequestNotFound { request_id: 42 })
        ));
    }
}
