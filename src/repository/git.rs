//! Git working-copy repository
//!
//! Shells out to `git -C <path>`. Conflicts are whatever git refuses to
//! apply or merge. A patch or merge changing a path outside the request's
//! target paths is refused before anything is written.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::diff::check_declared;
use super::{CommitPlan, CommitReceipt, RepoSnapshot, Repository};
use crate::config::RepositorySettings;
use crate::error::{Error, Result};
use crate::types::RequestKind;

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Repository backed by a git working copy
pub struct GitRepository {
    path: PathBuf,
    main_branch: String,
    author_name: String,
    author_email: String,
}

impl GitRepository {
    pub fn new(settings: &RepositorySettings) -> Self {
        Self {
            path: PathBuf::from(&settings.path),
            main_branch: settings.main_branch.clone(),
            author_name: settings.author_name.clone(),
            author_email: settings.author_email.clone(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput> {
        debug!(repo = %self.path.display(), ?args, "git");
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Repository(format!("failed to run git: {}", e)))?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run git; a non-zero exit is a write conflict
    async fn write(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args).await?;
        if !out.success {
            return Err(Error::write_conflict(format!("git {}: {}", args.join(" "), out.stderr)));
        }
        Ok(out.stdout)
    }

    /// Paths a patch file would change, from `git apply --numstat -z`
    async fn patch_paths(&self, patch: &str) -> Result<BTreeSet<String>> {
        let out = self.write(&["apply", "--numstat", "-z", patch]).await?;
        Ok(numstat_paths(&out))
    }

    /// Paths a merge of `branch` into main would change
    async fn merge_paths(&self, branch: &str) -> Result<BTreeSet<String>> {
        let range = format!("{}...{}", self.main_branch, branch);
        let out = self.write(&["diff", "--name-only", "-z", range.as_str()]).await?;
        Ok(out.split('\0').filter(|p| !p.is_empty()).map(str::to_string).collect())
    }

    async fn checkout_main(&self) -> Result<()> {
        self.write(&["checkout", "--quiet", self.main_branch.as_str()]).await?;
        Ok(())
    }

    fn message(plan: &CommitPlan) -> String {
        let req = &plan.request;
        let title = if req.draft.payload.description.is_empty() {
            format!("{} #{}", req.kind(), req.id)
        } else {
            req.draft.payload.description.lines().next().unwrap_or_default().to_string()
        };
        format!(
            "{}\n\nGatekeeper-Request: {}\nGatekeeper-Attempt: {}\nGatekeeper-Commit-Seq: {}\nGatekeeper-Submitter: {}\n",
            title,
            req.id,
            plan.attempt,
            plan.commit_seq,
            req.submitter()
        )
    }

    fn branch(plan: &CommitPlan) -> Result<&str> {
        plan.request
            .draft
            .payload
            .branch
            .as_deref()
            .ok_or_else(|| Error::Repository(format!("{} without a branch", plan.request.kind())))
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn revision(&self) -> Result<String> {
        let out = self.git(&["rev-parse", "HEAD"]).await?;
        if !out.success {
            return Err(Error::Repository(format!("git rev-parse HEAD: {}", out.stderr)));
        }
        Ok(out.stdout)
    }

    async fn apply(&mut self, plan: &CommitPlan) -> Result<CommitReceipt> {
        let message = Self::message(plan);
        let paths: Vec<String> = plan.request.target_paths().iter().cloned().collect();

        match plan.request.kind() {
            RequestKind::Commit => {
                self.checkout_main().await?;
                match plan.request.draft.payload.diff_ref.as_deref() {
                    Some(diff) => {
                        check_declared(&self.patch_paths(diff).await?, plan.request.target_paths())?;
                        self.write(&["apply", "--index", diff]).await?;
                    }
                    None => {
                        let mut args = vec!["add", "-A", "--"];
                        args.extend(paths.iter().map(String::as_str));
                        self.write(&args).await?;
                    }
                }
                self.write(&["commit", "--quiet", "-m", message.as_str()]).await?;
            }
            RequestKind::CreateBranch => {
                let branch = Self::branch(plan)?;
                self.write(&["branch", branch, self.main_branch.as_str()]).await?;
            }
            RequestKind::Merge => {
                let branch = Self::branch(plan)?;
                self.checkout_main().await?;
                check_declared(&self.merge_paths(branch).await?, plan.request.target_paths())?;
                if let Err(e) = self.write(&["merge", "--no-ff", "--quiet", "-m", message.as_str(), branch]).await {
                    let _ = self.git(&["merge", "--abort"]).await;
                    return Err(e);
                }
            }
            RequestKind::DeleteBranch => {
                let branch = Self::branch(plan)?;
                self.write(&["branch", "-D", branch]).await?;
            }
            RequestKind::TransferOwnership => {}
        }

        Ok(CommitReceipt {
            revision: self.revision().await?,
            paths,
        })
    }

    async fn revert(&mut self, revision: &str) -> Result<()> {
        let failed = |message: String| Error::RevertFailed {
            revision: revision.to_string(),
            message,
        };

        let _ = self.git(&["merge", "--abort"]).await;
        let out = self.git(&["checkout", "--quiet", "--force", self.main_branch.as_str()]).await?;
        if !out.success {
            return Err(failed(out.stderr));
        }
        let out = self.git(&["reset", "--hard", "--quiet", revision]).await?;
        if !out.success {
            return Err(failed(out.stderr));
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<RepoSnapshot> {
        let out = self
            .git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])
            .await?;
        if !out.success {
            return Err(Error::Repository(format!("git for-each-ref: {}", out.stderr)));
        }
        Ok(RepoSnapshot {
            revision: self.revision().await?,
            commit_seq: 0,
            branches: out.stdout.lines().map(str::to_string).collect(),
            files: Default::default(),
        })
    }
}

/// `added\tdeleted\tpath\0` records; a rename leaves the path empty and
/// follows with `old\0new\0`
fn numstat_paths(out: &str) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    let mut fields = out.split('\0');
    while let Some(record) = fields.next() {
        let Some(path) = record.splitn(3, '\t').nth(2) else {
            continue;
        };
        if path.is_empty() {
            paths.extend(fields.next().map(str::to_string));
            paths.extend(fields.next().map(str::to_string));
        } else {
            paths.insert(path.to_string());
        }
    }
    paths
}
