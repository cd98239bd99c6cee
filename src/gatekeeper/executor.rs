//! Single-writer commit executor
//!
//! The only component that mutates the shared repository. One async mutex
//! guards the repository; the commit sequence is assigned once it is held.
//! A failed write is reverted and recorded ROLLED_BACK before the lock is
//! released.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::tracker::RequestTracker;
use crate::error::{Error, Result};
use crate::ledger::{LedgerEntry, LedgerWriter, Transition};
use crate::registry::SharedRegistry;
use crate::repository::{CommitPlan, CommitReceipt, RepoSnapshot, Repository};
use crate::types::{QualityGateResult, Request, RequestId, RequestKind, RequestState};

/// How a commit attempt ended
#[derive(Debug)]
pub enum CommitOutcome {
    Completed(LedgerEntry),
    RolledBack(LedgerEntry),
    /// A cancellation arrived before the write started; nothing was recorded
    Cancelled,
}

/// Executes accepted requests one at a time
pub struct CommitExecutor {
    repo: Mutex<Box<dyn Repository>>,
    /// Last assigned commit sequence
    commit_seq: AtomicU64,
    /// Commit sequence of the last COMPLETED write
    completed_seq: AtomicU64,
    snapshot: RwLock<Arc<RepoSnapshot>>,
    /// Set when a revert failed; no further writes are attempted
    poisoned: AtomicBool,
    writer: LedgerWriter,
    registry: SharedRegistry,
    tracker: Arc<RequestTracker>,
}

impl CommitExecutor {
    pub async fn new(
        repo: Box<dyn Repository>,
        writer: LedgerWriter,
        registry: SharedRegistry,
        tracker: Arc<RequestTracker>,
    ) -> Result<Self> {
        let snapshot = repo.snapshot().await?;
        info!(backend = repo.name(), revision = %snapshot.revision, "Repository opened");
        Ok(Self {
            repo: Mutex::new(repo),
            commit_seq: AtomicU64::new(0),
            completed_seq: AtomicU64::new(0),
            snapshot: RwLock::new(Arc::new(snapshot)),
            poisoned: AtomicBool::new(false),
            writer,
            registry,
            tracker,
        })
    }

    /// Continue numbering after a restart
    pub fn restore_sequence(&self, last_assigned: u64, last_completed: u64) {
        self.commit_seq.store(last_assigned, Ordering::SeqCst);
        self.completed_seq.store(last_completed, Ordering::SeqCst);
        self.snapshot_mut(|s| s.commit_seq = last_completed);
    }

    pub fn completed_seq(&self) -> u64 {
        self.completed_seq.load(Ordering::SeqCst)
    }

    pub fn last_commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// Published repository view: before or after a write, never during
    pub fn snapshot(&self) -> Arc<RepoSnapshot> {
        Arc::clone(&*self.snapshot.read())
    }

    fn snapshot_mut(&self, f: impl FnOnce(&mut RepoSnapshot)) {
        let mut guard = self.snapshot.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────────────

    /// Run the write critical section for a request that passed its gates
    pub async fn commit(
        &self,
        request: &Request,
        attempt: u32,
        base_seq: u64,
        exempt: BTreeSet<RequestId>,
        gate_results: Vec<QualityGateResult>,
    ) -> Result<CommitOutcome> {
        let mut repo = self.repo.lock().await;

        if self.is_poisoned() {
            return Err(Error::Repository(
                "repository is in an unknown state after a failed revert".to_string(),
            ));
        }
        if !self.tracker.begin_commit(request.id) {
            return Ok(CommitOutcome::Cancelled);
        }

        let pre = repo.revision().await?;
        let commit_seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;

        self.writer.record(
            Transition::new(request.id, attempt, Some(RequestState::Testing), RequestState::Committing)
                .commit(commit_seq, pre.clone())
                .gate_results(gate_results)
                .reason(format!("all gates passed; write #{} started", commit_seq)),
        )?;
        info!(request_id = request.id, attempt, commit_seq, revision = %pre, "Commit started");

        let plan = CommitPlan {
            request: request.clone(),
            attempt,
            commit_seq,
            base_seq,
            exempt,
        };

        let applied = match repo.apply(&plan).await {
            Ok(receipt) => self.apply_side_effects(request).map(|()| receipt),
            Err(e) => Err(e),
        };

        match applied {
            Ok(receipt) => self.complete(&mut **repo, request, attempt, commit_seq, receipt).await,
            Err(e) => self.roll_back(&mut **repo, request, attempt, commit_seq, &pre, e).await,
        }
    }

    /// Registry changes made under the write lock
    fn apply_side_effects(&self, request: &Request) -> Result<()> {
        if request.kind() != RequestKind::TransferOwnership {
            return Ok(());
        }
        let pattern = request
            .target_paths()
            .iter()
            .next()
            .ok_or_else(|| Error::Internal("transfer without a pattern".to_string()))?;
        let new_owner = request
            .draft
            .payload
            .new_owner
            .as_deref()
            .ok_or_else(|| Error::Internal("transfer without a new owner".to_string()))?;

        let mut registry = self.registry.write();
        let mut next = registry.clone();
        next.transfer(pattern, new_owner)?;
        next.save()?;
        *registry = next;
        Ok(())
    }

    async fn complete(
        &self,
        repo: &mut dyn Repository,
        request: &Request,
        attempt: u32,
        commit_seq: u64,
        receipt: CommitReceipt,
    ) -> Result<CommitOutcome> {
        let mut snapshot = repo.snapshot().await.unwrap_or_else(|e| {
            warn!(error = %e, "Snapshot after commit failed; publishing revision only");
            RepoSnapshot {
                revision: receipt.revision.clone(),
                ..(**self.snapshot.read()).clone()
            }
        });
        snapshot.commit_seq = commit_seq;
        *self.snapshot.write() = Arc::new(snapshot);
        self.completed_seq.fetch_max(commit_seq, Ordering::SeqCst);

        let entry = self.writer.record(
            Transition::new(request.id, attempt, Some(RequestState::Committing), RequestState::Completed)
                .commit(commit_seq, receipt.revision.clone())
                .reason(format!("committed as {}", receipt.revision)),
        )?;
        info!(
            request_id = request.id,
            attempt,
            commit_seq,
            revision = %receipt.revision,
            paths = receipt.paths.len(),
            "Commit completed"
        );
        Ok(CommitOutcome::Completed(entry))
    }

    async fn roll_back(
        &self,
        repo: &mut dyn Repository,
        request: &Request,
        attempt: u32,
        commit_seq: u64,
        pre: &str,
        cause: Error,
    ) -> Result<CommitOutcome> {
        warn!(request_id = request.id, attempt, commit_seq, error = %cause, "Write failed, reverting");

        if let Err(e) = repo.revert(pre).await {
            error!(request_id = request.id, commit_seq, error = %e, "Revert failed; refusing further writes");
            self.poisoned.store(true, Ordering::SeqCst);
            return Err(e);
        }

        let entry = self.writer.record(
            Transition::new(request.id, attempt, Some(RequestState::Committing), RequestState::RolledBack)
                .commit(commit_seq, pre)
                .reason(format!("{}; reverted to {}", cause, pre)),
        )?;
        Ok(CommitOutcome::RolledBack(entry))
    }

    /// Revert a write interrupted by a restart and record ROLLED_BACK.
    ///
    /// A failed revert is recorded too, and poisons the executor: startup
    /// continues but no write is attempted until the repository is repaired.
    pub async fn recover_interrupted(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        let mut repo = self.repo.lock().await;
        let commit_seq = entry.commit_seq.unwrap_or_default();
        let mut transition =
            Transition::new(entry.request_id, entry.attempt, Some(RequestState::Committing), RequestState::RolledBack);
        if let Some(pre) = &entry.revision {
            transition = transition.commit(commit_seq, pre.clone());
        }

        let reverted = match entry.revision.as_deref() {
            Some(pre) => repo.revert(pre).await.map(|()| pre.to_string()),
            None => Err(Error::Internal(format!("COMMITTING entry #{} has no revision", entry.seq))),
        };

        let pre = match reverted {
            Ok(pre) => pre,
            Err(e) => {
                error!(
                    request_id = entry.request_id,
                    commit_seq,
                    error = %e,
                    "Interrupted write could not be reverted; refusing further writes"
                );
                self.poisoned.store(true, Ordering::SeqCst);
                return self.writer.record(
                    transition.reason(format!("interrupted during commit; {}; writes suspended", e)),
                );
            }
        };

        let snapshot = repo.snapshot().await?;
        self.snapshot_mut(|s| {
            s.revision = snapshot.revision;
            s.branches = snapshot.branches;
            s.files = snapshot.files;
        });
        self.writer
            .record(transition.reason(format!("interrupted during commit; reverted to {}", pre)))
    }
}
