//! External program checks
//!
//! `CommandCheck` passes when the program exits 0. `CoverageCheck` reads the
//! last percentage the program prints and compares it to a threshold.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CheckContext, CheckVerdict, QualityCheck};
use crate::error::{Error, Result};

/// Lines of output kept as evidence
const DETAIL_LINES: usize = 40;

/// Output of one program run
struct Run {
    success: bool,
    code: Option<i32>,
    output: String,
}

/// Program invocation shared by both adapters
#[derive(Debug, Clone)]
struct Invocation {
    name: String,
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Invocation {
    async fn run(&self, ctx: &CheckContext) -> Result<Run> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(match &self.workdir {
                Some(dir) => ctx.workdir.join(dir),
                None => ctx.workdir.clone(),
            })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The runner's timeout drops this future; the child must go with it.
            .kill_on_drop(true);
        for (key, value) in ctx.env_vars() {
            cmd.env(key, value);
        }
        cmd.envs(&self.env);

        tracing::debug!(check = %self.name, program = %self.program, args = ?self.args, "Running check");

        let output = cmd.output().await.map_err(|e| Error::Check {
            check: self.name.clone(),
            message: format!("failed to start '{}': {}", self.program, e),
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(Run {
            success: output.status.success(),
            code: output.status.code(),
            output: text,
        })
    }
}

/// Last `n` lines of `text`
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn exit_description(run: &Run) -> String {
    match run.code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────
// Command Check
// ─────────────────────────────────────────────────────────────────

/// Runs a program; exit status 0 is a pass
#[derive(Debug, Clone)]
pub struct CommandCheck {
    inv: Invocation,
    timeout: Duration,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            inv: Invocation {
                name: name.into(),
                program: program.into(),
                args,
                workdir: None,
                env: BTreeMap::new(),
            },
            timeout,
        }
    }

    pub fn workdir(mut self, dir: Option<PathBuf>) -> Self {
        self.inv.workdir = dir;
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.inv.env = env;
        self
    }
}

#[async_trait]
impl QualityCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.inv.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckVerdict> {
        let run = self.inv.run(ctx).await?;
        let summary = format!("{} {}", self.inv.program, exit_description(&run));
        let verdict = if run.success {
            CheckVerdict::pass(summary)
        } else {
            CheckVerdict::fail(summary)
        };
        Ok(verdict.with_detail(tail(&run.output, DETAIL_LINES)))
    }
}

// ─────────────────────────────────────────────────────────────────
// Coverage Check
// ─────────────────────────────────────────────────────────────────

/// Runs a program that prints a coverage percentage
#[derive(Debug, Clone)]
pub struct CoverageCheck {
    inv: Invocation,
    threshold: f64,
    timeout: Duration,
}

impl CoverageCheck {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        threshold: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            inv: Invocation {
                name: name.into(),
                program: program.into(),
                args,
                workdir: None,
                env: BTreeMap::new(),
            },
            threshold,
            timeout,
        }
    }

    pub fn workdir(mut self, dir: Option<PathBuf>) -> Self {
        self.inv.workdir = dir;
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.inv.env = env;
        self
    }
}

/// Last `NN%` / `NN.N%` token in the output
pub fn parse_percentage(output: &str) -> Option<f64> {
    output
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',' || c == '|')
        .filter_map(|token| token.strip_suffix('%'))
        .filter_map(|num| num.parse::<f64>().ok())
        .filter(|v| (0.0..=100.0).contains(v))
        .last()
}

#[async_trait]
impl QualityCheck for CoverageCheck {
    fn name(&self) -> &str {
        &self.inv.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckVerdict> {
        let run = self.inv.run(ctx).await?;
        let detail = tail(&run.output, DETAIL_LINES);

        if !run.success {
            return Ok(CheckVerdict::fail(format!(
                "{} {}",
                self.inv.program,
                exit_description(&run)
            ))
            .with_detail(detail));
        }

        let Some(pct) = parse_percentage(&run.output) else {
            return Err(Error::Check {
                check: self.inv.name.clone(),
                message: "no coverage percentage in output".to_string(),
            });
        };

        let verdict = if pct >= self.threshold {
            CheckVerdict::pass(format!("coverage {:.1}% >= {:.1}%", pct, self.threshold))
        } else {
            CheckVerdict::fail(format!("coverage {:.1}% < {:.1}%", pct, self.threshold))
        };
        Ok(verdict.with_detail(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Request, RequestDraft, RequestKind};

    fn ctx() -> CheckContext {
        CheckContext {
            request: Request::new(9, RequestDraft::new("w1", RequestKind::Commit).with_paths(["src/lib.rs"])),
            attempt: 2,
            workdir: std::env::temp_dir(),
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_parse_percentage() {
        assert_eq!(parse_percentage("TOTAL   120   12   90%"), Some(90.0));
        assert_eq!(parse_percentage("lines: 81.25% (130/160)\nbranches: 70%"), Some(70.0));
        assert_eq!(parse_percentage("coverage (66.6%)"), Some(66.6));
        assert_eq!(parse_percentage("no numbers here"), None);
        assert_eq!(parse_percentage("bogus 250%"), None);
    }

    #[test]
    fn test_tail() {
        let text = (1..=50).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let t = tail(&text, 3);
        assert_eq!(t, "48\n49\n50");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_status() {
        let pass = CommandCheck::new("ok", "sh", sh("echo fine"), Duration::from_secs(5));
        let verdict = pass.run(&ctx()).await.unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.detail, "fine");

        let fail = CommandCheck::new("bad", "sh", sh("echo broken >&2; exit 3"), Duration::from_secs(5));
        let verdict = fail.run(&ctx()).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.summary.contains("exit status 3"));
        assert!(verdict.detail.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_sees_request_env() {
        let check = CommandCheck::new(
            "env",
            "sh",
            sh("test \"$GATEKEEPER_REQUEST_ID\" = 9 && test \"$GATEKEEPER_ATTEMPT\" = 2 && test \"$EXTRA\" = yes"),
            Duration::from_secs(5),
        )
        .env([("EXTRA".to_string(), "yes".to_string())].into_iter().collect());

        assert!(check.run(&ctx()).await.unwrap().passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relative_workdir_resolves_inside_checkout() {
        let checkout = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(checkout.path().join("web")).unwrap();
        std::fs::write(checkout.path().join("web/package.json"), "{}").unwrap();
        let mut ctx = ctx();
        ctx.workdir = checkout.path().to_path_buf();

        let check = CommandCheck::new("web", "sh", sh("test -f package.json"), Duration::from_secs(5))
            .workdir(Some(PathBuf::from("web")));
        assert!(check.run(&ctx).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let check = CommandCheck::new("ghost", "definitely-not-a-real-program-42", vec![], Duration::from_secs(5));
        assert!(matches!(check.run(&ctx()).await, Err(Error::Check { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_coverage_threshold() {
        let above = CoverageCheck::new("cov", "sh", sh("echo 'TOTAL 85.0%'"), 80.0, Duration::from_secs(5));
        let verdict = above.run(&ctx()).await.unwrap();
        assert!(verdict.passed, "{}", verdict.summary);

        let below = CoverageCheck::new("cov", "sh", sh("echo 'TOTAL 79.9%'"), 80.0, Duration::from_secs(5));
        let verdict = below.run(&ctx()).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.summary.contains("79.9% < 80.0%"));

        let silent = CoverageCheck::new("cov", "sh", sh("true"), 80.0, Duration::from_secs(5));
        assert!(silent.run(&ctx()).await.is_err());
    }
}
