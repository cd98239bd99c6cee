//! Build script for the commit gatekeeper
//!
//! Embeds build-time information into the binary so that `gatekeeper version`
//! and the API handshake can report exactly which build is coordinating writes.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = is_git_dirty();
    let rustc_version = command_output("rustc", &["--version"]);

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=GATEKEEPER_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=GATEKEEPER_GIT_BRANCH={}", git_branch);
    println!("cargo:rustc-env=GATEKEEPER_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=GATEKEEPER_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=GATEKEEPER_TARGET={}", target);
    println!("cargo:rustc-env=GATEKEEPER_PROFILE={}", profile);
    println!("cargo:rustc-env=GATEKEEPER_RUSTC_VERSION={}", rustc_version);

    eprintln!("Building commit-gatekeeper:");
    eprintln!("  Git:     {}{}", git_hash, if git_dirty == "true" { " (dirty)" } else { "" });
    eprintln!("  Branch:  {}", git_branch);
    eprintln!("  Target:  {}", target);
    eprintln!("  Profile: {}", profile);
}

/// Run a command and return its trimmed stdout, or "unknown"
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Check if the git working directory is dirty
fn is_git_dirty() -> &'static str {
    Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .map(|output| {
            if output.status.success() && !output.stdout.is_empty() {
                "true"
            } else {
                "false"
            }
        })
        .unwrap_or("unknown")
}
