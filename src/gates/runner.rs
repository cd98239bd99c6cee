//! Quality-gate runner
//!
//! Runs the ordered check list for a request's kind. Every required check
//! produces exactly one result for the attempt: a check that errors or
//! times out is a failure, and with `fail_fast` the checks after a failure
//! are recorded as skipped. With [`Worktrees`] each attempt runs in its own
//! checkout; otherwise checks run in the configured working directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{CheckContext, CommandCheck, CoverageCheck, QualityCheck, StaticCheck, Worktrees};
use crate::config::{CheckAdapter, GateSettings};
use crate::error::{Error, Result};
use crate::types::{CheckFailure, Evidence, QualityGateResult, Request, RequestKind};

/// Runs quality gates with bounded concurrency
pub struct GateRunner {
    checks: HashMap<String, Arc<dyn QualityCheck>>,
    plans: HashMap<RequestKind, Vec<String>>,
    permits: Arc<Semaphore>,
    fail_fast: bool,
    workdir: PathBuf,
    worktrees: Option<Worktrees>,
}

impl GateRunner {
    pub fn new(max_concurrent: usize, fail_fast: bool, workdir: PathBuf) -> Self {
        Self {
            checks: HashMap::new(),
            plans: HashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            fail_fast,
            workdir,
            worktrees: None,
        }
    }

    /// Build the runner and its check adapters from configuration
    pub fn from_settings(settings: &GateSettings, max_concurrent: usize, workdir: PathBuf) -> Result<Self> {
        let mut runner = Self::new(max_concurrent, settings.fail_fast, workdir);

        for (name, cfg) in &settings.checks {
            let timeout = Duration::from_millis(cfg.timeout_ms.unwrap_or(settings.default_timeout_ms));
            let workdir = cfg.workdir.as_ref().map(PathBuf::from);

            let check: Arc<dyn QualityCheck> = match cfg.adapter {
                CheckAdapter::Command => {
                    let program = cfg.program.clone().ok_or_else(|| {
                        Error::config_field_invalid(format!("gates.checks.{}", name), "program is required")
                    })?;
                    Arc::new(
                        CommandCheck::new(name.clone(), program, cfg.args.clone(), timeout)
                            .workdir(workdir)
                            .env(cfg.env.clone()),
                    )
                }
                CheckAdapter::Coverage => {
                    let program = cfg.program.clone().ok_or_else(|| {
                        Error::config_field_invalid(format!("gates.checks.{}", name), "program is required")
                    })?;
                    Arc::new(
                        CoverageCheck::new(name.clone(), program, cfg.args.clone(), cfg.threshold.unwrap_or(0.0), timeout)
                            .workdir(workdir)
                            .env(cfg.env.clone()),
                    )
                }
                CheckAdapter::Static => Arc::new(StaticCheck::new(
                    name.clone(),
                    cfg.outcome,
                    Duration::from_millis(cfg.delay_ms),
                    timeout,
                )),
            };
            runner.checks.insert(name.clone(), check);
        }

        for (kind, names) in &settings.kinds {
            let kind: RequestKind = kind
                .parse()
                .map_err(|e: String| Error::config_field_invalid(format!("gates.kinds.{}", kind), e))?;
            runner.plans.insert(kind, names.clone());
        }

        info!(
            checks = runner.checks.len(),
            kinds = runner.plans.len(),
            fail_fast = runner.fail_fast,
            "Quality gates configured"
        );
        Ok(runner)
    }

    pub fn with_check(mut self, check: Arc<dyn QualityCheck>) -> Self {
        self.checks.insert(check.name().to_string(), check);
        self
    }

    pub fn with_worktrees(mut self, worktrees: Worktrees) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    pub fn with_plan(mut self, kind: RequestKind, names: &[&str]) -> Self {
        self.plans.insert(kind, names.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Ordered check names required for `kind`
    pub fn required_checks(&self, kind: RequestKind) -> Vec<String> {
        self.plans.get(&kind).cloned().unwrap_or_default()
    }

    /// Run every required check for one attempt of `request`
    pub async fn run(&self, request: &Request, attempt: u32) -> Vec<QualityGateResult> {
        let plan = self.required_checks(request.kind());
        if plan.is_empty() {
            return Vec::new();
        }

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return plan
                    .into_iter()
                    .map(|name| result(request, attempt, name, false, failed(CheckFailure::Error, "gate runner shut down", 0)))
                    .collect();
            }
        };

        let workdir = match &self.worktrees {
            Some(worktrees) => match worktrees.prepare(request, attempt).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(request_id = request.id, attempt, error = %e, "Check worktree not prepared");
                    return plan
                        .into_iter()
                        .map(|name| result(request, attempt, name, false, failed(CheckFailure::Error, &e.to_string(), 0)))
                        .collect();
                }
            },
            None => self.workdir.clone(),
        };

        let ctx = CheckContext {
            request: request.clone(),
            attempt,
            workdir,
        };
        let results = self.run_checks(&ctx, plan).await;

        if let Some(worktrees) = &self.worktrees {
            worktrees.remove(&ctx.workdir).await;
        }
        results
    }

    async fn run_checks(&self, ctx: &CheckContext, plan: Vec<String>) -> Vec<QualityGateResult> {
        let request = &ctx.request;
        let attempt = ctx.attempt;
        let mut results = Vec::with_capacity(plan.len());
        let mut failed_already = false;

        for name in plan {
            if failed_already && self.fail_fast {
                results.push(result(
                    request,
                    attempt,
                    name,
                    false,
                    failed(CheckFailure::Skipped, "not run after an earlier failure", 0),
                ));
                continue;
            }

            let Some(check) = self.checks.get(&name) else {
                failed_already = true;
                results.push(result(
                    request,
                    attempt,
                    name.clone(),
                    false,
                    failed(CheckFailure::Error, &format!("check '{}' is not defined", name), 0),
                ));
                continue;
            };

            let started = Instant::now();
            let outcome = tokio::time::timeout(check.timeout(), check.run(ctx)).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (passed, evidence) = match outcome {
                Ok(Ok(verdict)) => (
                    verdict.passed,
                    Evidence {
                        summary: verdict.summary,
                        detail: verdict.detail,
                        duration_ms,
                        failure: if verdict.passed { None } else { Some(CheckFailure::Failed) },
                    },
                ),
                Ok(Err(e)) => (false, failed(CheckFailure::Error, &e.to_string(), duration_ms)),
                Err(_) => {
                    let timeout_ms = check.timeout().as_millis() as u64;
                    (
                        false,
                        failed(CheckFailure::Timeout, &format!("exceeded {}ms", timeout_ms), timeout_ms),
                    )
                }
            };

            if passed {
                debug!(request_id = request.id, attempt, check = %name, duration_ms, "Check passed");
            } else {
                warn!(
                    request_id = request.id,
                    attempt,
                    check = %name,
                    failure = ?evidence.failure,
                    summary = %evidence.summary,
                    "Check failed"
                );
                failed_already = true;
            }
            results.push(result(request, attempt, name, passed, evidence));
        }

        results
    }
}

fn failed(kind: CheckFailure, summary: &str, duration_ms: u64) -> Evidence {
    Evidence {
        summary: summary.to_string(),
        detail: String::new(),
        duration_ms,
        failure: Some(kind),
    }
}

fn result(request: &Request, attempt: u32, check_name: String, passed: bool, evidence: Evidence) -> QualityGateResult {
    QualityGateResult {
        request_id: request.id,
        attempt,
        check_name,
        passed,
        evidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckSettings, StaticOutcome};
    use crate::types::{all_passed, RequestDraft};

    fn request(kind: RequestKind) -> Request {
        Request::new(1, RequestDraft::new("w1", kind).with_paths(["src/lib.rs"]))
    }

    fn runner(fail_fast: bool) -> GateRunner {
        GateRunner::new(2, fail_fast, std::env::temp_dir())
            .with_check(Arc::new(StaticCheck::passing("tests")))
            .with_check(Arc::new(StaticCheck::failing("lint")))
            .with_check(Arc::new(StaticCheck::hanging("slow", Duration::from_millis(30))))
            .with_check(Arc::new(StaticCheck::passing("docs")))
    }

    #[tokio::test]
    async fn test_all_pass() {
        let runner = runner(true).with_plan(RequestKind::Commit, &["tests", "docs"]);
        let results = runner.run(&request(RequestKind::Commit), 1).await;

        assert_eq!(results.len(), 2);
        assert!(all_passed(&results, &runner.required_checks(RequestKind::Commit), 1));
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_failure() {
        let runner = runner(false).with_plan(RequestKind::Commit, &["slow", "tests"]);
        let results = runner.run(&request(RequestKind::Commit), 3).await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].passed);
        assert_eq!(results[0].evidence.failure, Some(CheckFailure::Timeout));
        assert_eq!(results[0].evidence.duration_ms, 30);
        assert_eq!(results[0].attempt, 3);
        assert!(results[1].passed);
        assert!(!all_passed(&results, &runner.required_checks(RequestKind::Commit), 3));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_rest() {
        let runner = runner(true).with_plan(RequestKind::Commit, &["lint", "tests"]);
        let results = runner.run(&request(RequestKind::Commit), 1).await;

        assert_eq!(results[0].evidence.failure, Some(CheckFailure::Failed));
        assert_eq!(results[1].evidence.failure, Some(CheckFailure::Skipped));
        assert!(!results[1].passed);
    }

    #[tokio::test]
    async fn test_kind_without_plan_has_no_checks() {
        let runner = runner(true).with_plan(RequestKind::Commit, &["tests"]);
        assert!(runner.run(&request(RequestKind::CreateBranch), 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_undefined_check_fails() {
        let runner = runner(true).with_plan(RequestKind::Commit, &["ghost"]);
        let results = runner.run(&request(RequestKind::Commit), 1).await;
        assert_eq!(results[0].evidence.failure, Some(CheckFailure::Error));
    }

    #[tokio::test]
    async fn test_from_settings() {
        let mut settings = GateSettings::default();
        settings.kinds.clear();
        settings.checks.clear();
        settings.kinds.insert("commit".into(), vec!["quick".into()]);
        settings.checks.insert(
            "quick".into(),
            CheckSettings {
                adapter: CheckAdapter::Static,
                outcome: StaticOutcome::Fail,
                ..Default::default()
            },
        );

        let runner = GateRunner::from_settings(&settings, 1, std::env::temp_dir()).unwrap();
        assert_eq!(runner.required_checks(RequestKind::Commit), vec!["quick"]);
        let results = runner.run(&request(RequestKind::Commit), 1).await;
        assert!(!results[0].passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_checks_run_in_a_per_attempt_worktree() {
        use tokio::process::Command;

        let git = |dir: &std::path::Path, args: &[&str]| {
            let mut cmd = Command::new("git");
            cmd.arg("-C")
                .arg(dir)
                .args(args)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com");
            cmd
        };
        if git(&std::env::temp_dir(), &["--version"]).output().await.is_err() {
            return;
        }

        let repo = tempfile::TempDir::new().unwrap();
        let data = tempfile::TempDir::new().unwrap();
        for args in [&["init", "--quiet"][..], &["symbolic-ref", "HEAD", "refs/heads/main"][..]] {
            assert!(git(repo.path(), args).output().await.unwrap().status.success());
        }
        std::fs::write(repo.path().join("lib.rs"), "v1\n").unwrap();
        assert!(git(repo.path(), &["add", "-A"]).output().await.unwrap().status.success());
        assert!(git(repo.path(), &["commit", "--quiet", "-m", "init"]).output().await.unwrap().status.success());
        std::fs::write(repo.path().join("lib.rs"), "v2\n").unwrap();
        std::fs::write(repo.path().join("scratch.txt"), "not part of the request\n").unwrap();

        let settings = crate::config::RepositorySettings {
            path: repo.path().display().to_string(),
            ..Default::default()
        };
        let runner = GateRunner::new(2, true, repo.path().to_path_buf())
            .with_worktrees(Worktrees::new(&settings, data.path().join("worktrees")))
            .with_check(Arc::new(CommandCheck::new(
                "isolated",
                "sh",
                vec![
                    "-c".to_string(),
                    "test \"$(cat lib.rs)\" = v2 && test ! -e scratch.txt && pwd > \"$GATEKEEPER_MARK\"".to_string(),
                ],
                Duration::from_secs(10),
            )
            .env([("GATEKEEPER_MARK".to_string(), data.path().join("pwd").display().to_string())].into_iter().collect())))
            .with_plan(RequestKind::Commit, &["isolated"]);

        let request = Request::new(5, RequestDraft::new("w1", RequestKind::Commit).with_paths(["lib.rs"]));
        let results = runner.run(&request, 1).await;

        assert!(results[0].passed, "{}", results[0].evidence.summary);
        let ran_in = std::fs::read_to_string(data.path().join("pwd")).unwrap();
        assert!(ran_in.trim().ends_with("req-5-1"), "{}", ran_in);
        assert!(!data.path().join("worktrees/req-5-1").exists());
    }
}
