//! Restart recovery
//!
//! Rebuilds in-memory state from the request log and the ledger. Requests
//! that were queued or waiting resume; a gate run cut short fails its
//! attempt; an interrupted write is reverted.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::coordinator::Coordinator;
use super::tracker::Phase;
use crate::error::Result;
use crate::ledger::Transition;
use crate::types::RequestState;

/// What recovery did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Back in the mailbox for validation
    pub requeued: usize,
    /// Back in the scheduler
    pub resumed_waiting: usize,
    /// Gate runs failed as interrupted
    pub interrupted_testing: usize,
    /// Interrupted writes reverted
    pub rolled_back: usize,
}

impl Coordinator {
    pub(super) async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let entries = self.ledger.entries();
        let last_assigned = entries.iter().filter_map(|e| e.commit_seq).max().unwrap_or(0);
        let last_completed = entries
            .iter()
            .filter(|e| e.to == RequestState::Completed)
            .filter_map(|e| e.commit_seq)
            .max()
            .unwrap_or(0);
        self.executor.restore_sequence(last_assigned, last_completed);

        let requests = self.store.all();

        {
            let mut scheduler = self.scheduler.lock();
            for request in &requests {
                if let Err(e) = scheduler.register(request.id, request.depends_on()) {
                    debug!(request_id = request.id, error = %e, "Dependency edges not restored");
                }
            }
        }

        {
            let now = Utc::now();
            let mut dedup = self.dedup.lock();
            for request in &requests {
                dedup.record(request.submitter(), &request.content_hash, request.id, request.submitted_at);
            }
            dedup.prune(now);
        }

        for request in requests {
            let id = request.id;
            let Some(entry) = self.ledger.latest(id) else {
                warn!(request_id = id, "Request has no ledger trail, re-queueing");
                self.admission.record(
                    Transition::new(id, 1, None, RequestState::Pending)
                        .base(last_completed)
                        .reason("recovered without a ledger trail"),
                )?;
                let submitter = request.submitter().to_string();
                self.tracker.resume(request, 1, Phase::Queued);
                self.mailbox.push(&submitter, id)?;
                report.requeued += 1;
                continue;
            };

            match entry.to {
                RequestState::Pending | RequestState::Validating => {
                    let submitter = request.submitter().to_string();
                    self.tracker.resume(request, entry.attempt, Phase::Queued);
                    self.mailbox.push(&submitter, id)?;
                    report.requeued += 1;
                }
                RequestState::WaitingOnDependencies => {
                    self.tracker.resume(request, entry.attempt, Phase::Waiting);
                    self.scheduler.lock().wait(id, entry.attempt, Instant::now());
                    report.resumed_waiting += 1;
                }
                RequestState::Testing => {
                    self.gatekeeper.record(
                        Transition::new(id, entry.attempt, Some(RequestState::Testing), RequestState::GateFailed)
                            .reason("gate run interrupted by coordinator restart"),
                    )?;
                    report.interrupted_testing += 1;
                }
                RequestState::Committing => {
                    self.executor.recover_interrupted(&entry).await?;
                    report.rolled_back += 1;
                }
                _ => {}
            }
        }

        if report != RecoveryReport::default() {
            info!(?report, "Recovered interrupted requests");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{GatekeeperConfig, StaticOutcome};
    use crate::gatekeeper::Components;
    use crate::gates::{GateRunner, StaticCheck};
    use crate::ledger::WriterRole;
    use crate::registry::ResourceRegistry;
    use crate::repository::{MemoryRepository, Repository};
    use crate::types::{RequestDraft, RequestKind};

    fn config() -> GatekeeperConfig {
        let mut config = GatekeeperConfig::default();
        config.storage.persist = false;
        config.scheduler.tick_interval_ms = 20;
        config
    }

    fn gates() -> GateRunner {
        GateRunner::new(2, true, PathBuf::from("."))
            .with_check(Arc::new(StaticCheck::new(
                "tests",
                StaticOutcome::Pass,
                Duration::ZERO,
                Duration::from_secs(5),
            )))
            .with_plan(RequestKind::Commit, &["tests"])
    }

    fn components(repo: MemoryRepository) -> Components {
        Components::in_memory(ResourceRegistry::from_resources(vec![]).unwrap(), Box::new(repo))
    }

    fn commit(submitter: &str, path: &str) -> RequestDraft {
        RequestDraft::new(submitter, RequestKind::Commit).with_paths([path])
    }

    #[tokio::test]
    async fn test_interrupted_testing_fails_attempt() {
        let parts = components(MemoryRepository::new("main"));
        let request = parts.store.insert(commit("bob", "a.txt")).unwrap();
        let v = parts.ledger.writer(WriterRole::Validator);
        let g = parts.ledger.writer(WriterRole::Gatekeeper);
        v.record(Transition::new(request.id, 1, None, RequestState::Pending)).unwrap();
        v.record(Transition::new(request.id, 1, Some(RequestState::Pending), RequestState::Validating)).unwrap();
        v.record(Transition::new(request.id, 1, Some(RequestState::Validating), RequestState::WaitingOnDependencies)).unwrap();
        g.record(Transition::new(request.id, 1, Some(RequestState::WaitingOnDependencies), RequestState::Testing)).unwrap();

        let coordinator = Coordinator::new(config(), parts, gates()).await.unwrap();
        let report = coordinator.recover().await.unwrap();

        assert_eq!(report.interrupted_testing, 1);
        let status = coordinator.status(request.id).unwrap();
        assert_eq!(status.state, RequestState::GateFailed);
        assert!(status.reason.contains("interrupted"));
    }

    #[tokio::test]
    async fn test_interrupted_commit_is_reverted() {
        let repo = MemoryRepository::new("main");
        let pre = repo.revision().await.unwrap();

        let parts = components(repo);
        let request = parts.store.insert(commit("bob", "a.txt")).unwrap();
        let v = parts.ledger.writer(WriterRole::Validator);
        let g = parts.ledger.writer(WriterRole::Gatekeeper);
        v.record(Transition::new(request.id, 1, None, RequestState::Pending)).unwrap();
        v.record(Transition::new(request.id, 1, Some(RequestState::Pending), RequestState::Validating)).unwrap();
        v.record(Transition::new(request.id, 1, Some(RequestState::Validating), RequestState::WaitingOnDependencies)).unwrap();
        g.record(Transition::new(request.id, 1, Some(RequestState::WaitingOnDependencies), RequestState::Testing)).unwrap();
        g.record(
            Transition::new(request.id, 1, Some(RequestState::Testing), RequestState::Committing)
                .commit(1, pre.clone()),
        )
        .unwrap();

        let coordinator = Coordinator::new(config(), parts, gates()).await.unwrap();
        let report = coordinator.recover().await.unwrap();

        assert_eq!(report.rolled_back, 1);
        let status = coordinator.status(request.id).unwrap();
        assert_eq!(status.state, RequestState::RolledBack);
        assert_eq!(status.revision.as_deref(), Some(pre.as_str()));
        assert_eq!(coordinator.ledger().committing(), None);
    }

    #[tokio::test]
    async fn test_unrevertable_interrupted_commit_still_starts() {
        // The repository no longer knows "mem-1", so the revert cannot succeed.
        let parts = components(MemoryRepository::new("main"));
        let first = parts.store.insert(commit("bob", "a.txt")).unwrap();
        let second = parts.store.insert(commit("carol", "b.txt")).unwrap();
        let v = parts.ledger.writer(WriterRole::Validator);
        let g = parts.ledger.writer(WriterRole::Gatekeeper);
        for request in [&first, &second] {
            v.record(Transition::new(request.id, 1, None, RequestState::Pending)).unwrap();
            v.record(Transition::new(request.id, 1, Some(RequestState::Pending), RequestState::Validating)).unwrap();
            v.record(Transition::new(request.id, 1, Some(RequestState::Validating), RequestState::WaitingOnDependencies)).unwrap();
            g.record(Transition::new(request.id, 1, Some(RequestState::WaitingOnDependencies), RequestState::Testing)).unwrap();
        }
        g.record(Transition::new(first.id, 1, Some(RequestState::Testing), RequestState::Committing).commit(1, "mem-0")).unwrap();
        g.record(Transition::new(first.id, 1, Some(RequestState::Committing), RequestState::Completed).commit(1, "mem-1")).unwrap();
        g.record(Transition::new(second.id, 1, Some(RequestState::Testing), RequestState::Committing).commit(2, "mem-1")).unwrap();

        let coordinator = Coordinator::new(config(), parts, gates()).await.unwrap();
        let report = coordinator.recover().await.unwrap();

        assert_eq!(report.rolled_back, 1);
        let status = coordinator.status(second.id).unwrap();
        assert_eq!(status.state, RequestState::RolledBack);
        assert!(status.reason.contains("writes suspended"), "{}", status.reason);
        assert!(coordinator.executor.is_poisoned());
        assert_eq!(coordinator.ledger().committing(), None);
    }

    #[tokio::test]
    async fn test_completed_write_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.storage.persist = true;
        config.storage.data_dir = dir.path().display().to_string();
        config.registry.path = dir.path().join("resources.toml").display().to_string();

        let id = {
            let parts = Components::open(&config).unwrap();
            let coordinator = Coordinator::new(config.clone(), parts, gates()).await.unwrap();
            let _tasks = coordinator.start().await.unwrap();
            let id = coordinator.submit(commit("bob", "a.txt")).await.unwrap().request_id();
            let mut sub = coordinator
                .ledger()
                .subscribe_after(0, move |e| e.request_id == id && e.to == RequestState::Completed);
            tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .expect("request did not complete")
                .expect("ledger closed");
            coordinator.stop();
            id
        };

        let parts = Components::open(&config).unwrap();
        let reopened = Coordinator::new(config, parts, gates()).await.unwrap();
        reopened.recover().await.unwrap();

        assert_eq!(reopened.status(id).unwrap().state, RequestState::Completed);
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot.commit_seq, 1);
        assert!(snapshot.files.contains_key("a.txt"));
        assert_eq!(reopened.executor.completed_seq(), 1);
    }

    #[tokio::test]
    async fn test_queued_request_resumes_after_restart() {
        let parts = components(MemoryRepository::new("main"));
        let request = parts.store.insert(commit("bob", "a.txt")).unwrap();
        parts
            .ledger
            .writer(WriterRole::Validator)
            .record(Transition::new(request.id, 1, None, RequestState::Pending))
            .unwrap();

        let coordinator = Coordinator::new(config(), parts, gates()).await.unwrap();
        let _tasks = coordinator.start().await.unwrap();

        let id = request.id;
        let mut sub = coordinator
            .ledger()
            .subscribe_after(0, move |e| e.request_id == id && e.to == RequestState::Completed);
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("request did not complete")
            .expect("ledger closed");
    }

    #[tokio::test]
    async fn test_request_without_trail_is_requeued() {
        let parts = components(MemoryRepository::new("main"));
        let request = parts.store.insert(commit("bob", "a.txt")).unwrap();

        let coordinator = Coordinator::new(config(), parts, gates()).await.unwrap();
        let report = coordinator.recover().await.unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(coordinator.status(request.id).unwrap().state, RequestState::Pending);
    }

    #[tokio::test]
    async fn test_commit_sequence_continues() {
        let parts = components(MemoryRepository::new("main"));
        let request = parts.store.insert(commit("bob", "a.txt")).unwrap();
        let v = parts.ledger.writer(WriterRole::Validator);
        let g = parts.ledger.writer(WriterRole::Gatekeeper);
        v.record(Transition::new(request.id, 1, None, RequestState::Pending)).unwrap();
        v.record(Transition::new(request.id, 1, Some(RequestState::Pending), RequestState::Validating)).unwrap();
        v.record(Transition::new(request.id, 1, Some(RequestState::Validating), RequestState::WaitingOnDependencies)).unwrap();
        g.record(Transition::new(request.id, 1, Some(RequestState::WaitingOnDependencies), RequestState::Testing)).unwrap();
        g.record(Transition::new(request.id, 1, Some(RequestState::Testing), RequestState::Committing).commit(7, "mem-0")).unwrap();
        g.record(Transition::new(request.id, 1, Some(RequestState::Committing), RequestState::Completed).commit(7, "mem-1")).unwrap();

        let coordinator = Coordinator::new(config(), parts, gates()).await.unwrap();
        coordinator.recover().await.unwrap();

        assert_eq!(coordinator.executor.last_commit_seq(), 7);
        assert_eq!(coordinator.executor.completed_seq(), 7);
    }
}
