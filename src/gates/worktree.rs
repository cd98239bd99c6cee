//! Per-attempt check worktrees
//!
//! With the git backend each gate run gets a detached worktree of the main
//! branch with the request's change applied on top. Checks never run in the
//! shared working copy, and two attempts never share a directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::RepositorySettings;
use crate::error::{Error, Result};
use crate::types::{Request, RequestKind};

/// Creates and removes check worktrees of one repository
#[derive(Debug, Clone)]
pub struct Worktrees {
    repo: PathBuf,
    main_branch: String,
    root: PathBuf,
    author_name: String,
    author_email: String,
}

impl Worktrees {
    pub fn new(settings: &RepositorySettings, root: impl Into<PathBuf>) -> Self {
        Self {
            repo: PathBuf::from(&settings.path),
            main_branch: settings.main_branch.clone(),
            root: root.into(),
            author_name: settings.author_name.clone(),
            author_email: settings.author_email.clone(),
        }
    }

    /// Check out main into a fresh directory and apply the request's change
    pub async fn prepare(&self, request: &Request, attempt: u32) -> Result<PathBuf> {
        let path = self.root.join(format!("req-{}-{}", request.id, attempt));
        if path.exists() {
            self.remove(&path).await;
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::IoWrite {
            path: self.root.clone(),
            source: e,
        })?;

        let dir = path.display().to_string();
        self.git(&self.repo, &["worktree", "add", "--quiet", "--detach", dir.as_str(), self.main_branch.as_str()])
            .await?;

        if let Err(e) = self.apply_change(request, &path).await {
            self.remove(&path).await;
            return Err(e);
        }
        debug!(request_id = request.id, attempt, worktree = %path.display(), "Check worktree ready");
        Ok(path)
    }

    /// Remove a worktree; failures are logged and pruned on the next run
    pub async fn remove(&self, path: &Path) {
        let dir = path.display().to_string();
        if let Err(e) = self.git(&self.repo, &["worktree", "remove", "--force", dir.as_str()]).await {
            warn!(worktree = %dir, error = %e, "Worktree not removed cleanly");
            let _ = fs::remove_dir_all(path);
            let _ = self.git(&self.repo, &["worktree", "prune"]).await;
        }
    }

    async fn apply_change(&self, request: &Request, path: &Path) -> Result<()> {
        match request.kind() {
            RequestKind::Commit => match request.draft.payload.diff_ref.as_deref() {
                Some(patch) => {
                    let patch = self.repo.join(patch).display().to_string();
                    self.git(path, &["apply", patch.as_str()]).await
                }
                None => {
                    for target in request.target_paths() {
                        sync_path(&self.repo.join(target), &path.join(target)).map_err(|e| Error::Check {
                            check: "worktree".to_string(),
                            message: format!("copying {}: {}", target, e),
                        })?;
                    }
                    Ok(())
                }
            },
            RequestKind::Merge => {
                let branch = request.draft.payload.branch.as_deref().unwrap_or_default();
                self.git(path, &["merge", "--quiet", "--no-ff", "--no-edit", branch]).await
            }
            RequestKind::CreateBranch | RequestKind::DeleteBranch | RequestKind::TransferOwnership => Ok(()),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Check {
                check: "worktree".to_string(),
                message: format!("failed to run git: {}", e),
            })?;

        if !output.status.success() {
            return Err(Error::Check {
                check: "worktree".to_string(),
                message: format!(
                    "git {}: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Make `dst` match `src`: copy a file or directory tree, or delete `dst`
/// when `src` no longer exists
fn sync_path(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.exists() {
        return match fs::metadata(dst) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(dst),
            Ok(_) => fs::remove_file(dst),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
    }

    if src.is_dir() {
        if dst.is_file() {
            fs::remove_file(dst)?;
        }
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            sync_path(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).map(|_| ())
}
