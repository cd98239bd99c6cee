//! In-process repository
//!
//! Tracks the last writer of every path and detects conflicts
//! optimistically: a write conflicts when another request wrote an
//! overlapping path after the attempt's base commit, unless that request is
//! one of its dependencies.
//!
//! With a journal every write and revert is appended to a JSON-lines file
//! before it takes effect, and [`MemoryRepository::open`] replays it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CommitPlan, CommitReceipt, FileVersion, RepoSnapshot, Repository};
use crate::error::{Error, Result};
use crate::storage::JsonLines;
use crate::types::RequestKind;
use crate::validator::paths_overlap;

/// Failures injected into the next writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Write the paths, then fail with a write conflict
    ConflictAfterWrite,
    /// Fail the revert following the next failed write
    RevertFails,
}

/// Handle for injecting faults into a repository owned by the gatekeeper
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    queue: Arc<Mutex<VecDeque<Fault>>>,
}

impl FaultInjector {
    pub fn push(&self, fault: Fault) {
        self.queue.lock().push_back(fault);
    }

    fn take(&self, fault: &Fault) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|f| f == fault) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Write {
        revision: u64,
        commit_seq: u64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        files: BTreeMap<String, FileVersion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted: Option<String>,
    },
    Revert {
        revision: u64,
    },
}

#[derive(Debug, Clone)]
struct State {
    revision: u64,
    commit_seq: u64,
    files: BTreeMap<String, FileVersion>,
    branches: BTreeSet<String>,
}

impl State {
    fn initial(main_branch: &str) -> Self {
        Self {
            revision: 0,
            commit_seq: 0,
            files: BTreeMap::new(),
            branches: [main_branch.to_string()].into_iter().collect(),
        }
    }

    /// State after a `Write` record
    fn written(&self, record: &JournalRecord) -> Self {
        let mut next = self.clone();
        if let JournalRecord::Write {
            revision,
            commit_seq,
            files,
            created,
            deleted,
        } = record
        {
            next.revision = *revision;
            next.commit_seq = *commit_seq;
            next.files.extend(files.iter().map(|(path, version)| (path.clone(), *version)));
            if let Some(branch) = created {
                next.branches.insert(branch.clone());
            }
            if let Some(branch) = deleted {
                next.branches.remove(branch);
            }
        }
        next
    }
}

/// In-memory repository
pub struct MemoryRepository {
    state: State,
    /// State before the last write: the only revert target other than the
    /// current revision
    previous: Option<State>,
    journal: Option<JsonLines>,
    faults: FaultInjector,
}

impl MemoryRepository {
    pub fn new(main_branch: &str) -> Self {
        Self {
            state: State::initial(main_branch),
            previous: None,
            journal: None,
            faults: FaultInjector::default(),
        }
    }

    /// Replay the journal at `path` and keep appending to it
    pub fn open(main_branch: &str, path: &Path, fsync: bool) -> Result<Self> {
        let mut repo = Self::new(main_branch);
        let records: Vec<JournalRecord> = JsonLines::read_all(path)?;
        for record in &records {
            repo.replay(record).map_err(|e| {
                Error::Repository(format!("journal {}: {}", path.display(), e))
            })?;
        }
        info!(
            path = %path.display(),
            records = records.len(),
            revision = %Self::revision_name(repo.state.revision),
            files = repo.state.files.len(),
            "Repository journal replayed"
        );
        repo.journal = Some(JsonLines::open(path, fsync)?);
        Ok(repo)
    }

    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn revision_name(revision: u64) -> String {
        format!("mem-{}", revision)
    }

    fn replay(&mut self, record: &JournalRecord) -> Result<()> {
        match record {
            JournalRecord::Write { .. } => {
                let next = self.state.written(record);
                self.previous = Some(std::mem::replace(&mut self.state, next));
            }
            JournalRecord::Revert { revision } => {
                if self.state.revision == *revision {
                    return Ok(());
                }
                match self.previous.take() {
                    Some(previous) if previous.revision == *revision => self.state = previous,
                    _ => {
                        return Err(Error::Repository(format!(
                            "revert to unknown revision {}",
                            Self::revision_name(*revision)
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, record: &JournalRecord) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(record),
            None => Ok(()),
        }
    }

    fn conflict(&self, plan: &CommitPlan) -> Option<String> {
        for path in plan.request.target_paths() {
            for (existing, version) in &self.state.files {
                if version.commit_seq > plan.base_seq
                    && version.request_id != plan.request.id
                    && !plan.exempt.contains(&version.request_id)
                    && paths_overlap(path, existing)
                {
                    return Some(format!(
                        "'{}' was written by request #{} (commit {}) after base commit {}",
                        existing, version.request_id, version.commit_seq, plan.base_seq
                    ));
                }
            }
        }
        None
    }

    fn branch(plan: &CommitPlan) -> Result<String> {
        plan.request
            .draft
            .payload
            .branch
            .clone()
            .ok_or_else(|| Error::Repository(format!("{} without a branch", plan.request.kind())))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn revision(&self) -> Result<String> {
        Ok(Self::revision_name(self.state.revision))
    }

    async fn apply(&mut self, plan: &CommitPlan) -> Result<CommitReceipt> {
        let mut files = BTreeMap::new();
        let mut created = None;
        let mut deleted = None;

        match plan.request.kind() {
            RequestKind::Commit => {
                if let Some(reason) = self.conflict(plan) {
                    return Err(Error::write_conflict(reason));
                }
                for path in plan.request.target_paths() {
                    files.insert(
                        path.clone(),
                        FileVersion {
                            commit_seq: plan.commit_seq,
                            request_id: plan.request.id,
                        },
                    );
                }
            }
            RequestKind::CreateBranch => {
                let branch = Self::branch(plan)?;
                if self.state.branches.contains(&branch) {
                    return Err(Error::write_conflict(format!("branch '{}' already exists", branch)));
                }
                created = Some(branch);
            }
            RequestKind::DeleteBranch => {
                let branch = Self::branch(plan)?;
                if !self.state.branches.contains(&branch) {
                    return Err(Error::write_conflict(format!("branch '{}' does not exist", branch)));
                }
                deleted = Some(branch);
            }
            RequestKind::Merge => {
                let branch = Self::branch(plan)?;
                if !self.state.branches.contains(&branch) {
                    return Err(Error::write_conflict(format!("branch '{}' does not exist", branch)));
                }
            }
            RequestKind::TransferOwnership => {}
        }

        let paths: Vec<String> = files.keys().cloned().collect();
        let record = JournalRecord::Write {
            revision: self.state.revision + 1,
            commit_seq: plan.commit_seq,
            files,
            created,
            deleted,
        };
        self.record(&record)?;
        let next = self.state.written(&record);
        self.previous = Some(std::mem::replace(&mut self.state, next));

        if self.faults.take(&Fault::ConflictAfterWrite) {
            return Err(Error::write_conflict("injected conflict after write"));
        }

        Ok(CommitReceipt {
            revision: Self::revision_name(self.state.revision),
            paths,
        })
    }

    async fn revert(&mut self, revision: &str) -> Result<()> {
        let failed = |message: String| Error::RevertFailed {
            revision: revision.to_string(),
            message,
        };

        if self.faults.take(&Fault::RevertFails) {
            return Err(failed("injected revert failure".to_string()));
        }
        if Self::revision_name(self.state.revision) == revision {
            return Ok(());
        }
        let target = match &self.previous {
            Some(previous) if Self::revision_name(previous.revision) == revision => previous.revision,
            _ => return Err(failed("unknown revision".to_string())),
        };

        self.record(&JournalRecord::Revert { revision: target })
            .map_err(|e| failed(e.to_string()))?;
        if let Some(previous) = self.previous.take() {
            self.state = previous;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<RepoSnapshot> {
        Ok(RepoSnapshot {
            revision: Self::revision_name(self.state.revision),
            commit_seq: self.state.commit_seq,
            branches: self.state.branches.clone(),
            files: self.state.files.clone(),
        })
    }
}
