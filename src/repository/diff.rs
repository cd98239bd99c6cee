//! Paths changed by a patch file
//!
//! Reads the file headers of a git-style unified diff (`diff --git`,
//! `---`/`+++`, rename and copy lines) and skips hunk bodies by their line
//! counts, so a removed line that starts with `--` is never read as a header.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Every path the patch creates, modifies, deletes, renames or copies
/// (both sides of a rename)
pub fn changed_paths(patch: &str) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    let mut old_left = 0usize;
    let mut new_left = 0usize;

    for line in patch.lines() {
        if old_left > 0 || new_left > 0 {
            match line.as_bytes().first() {
                Some(b'-') => old_left = old_left.saturating_sub(1),
                Some(b'+') => new_left = new_left.saturating_sub(1),
                Some(b'\\') => {}
                _ => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("@@ ") {
            (old_left, new_left) = hunk_counts(rest);
        } else if let Some(rest) = line.strip_prefix("diff --git ") {
            paths.extend(git_header_path(rest));
        } else if let Some(rest) = line.strip_prefix("--- ").or_else(|| line.strip_prefix("+++ ")) {
            paths.extend(header_path(rest));
        } else if let Some(rest) = ["rename from ", "rename to ", "copy from ", "copy to "]
            .iter()
            .find_map(|p| line.strip_prefix(p))
        {
            paths.insert(unquote(rest));
        }
    }
    paths
}

/// Read a patch file and list its changed paths
pub fn read_changed_paths(path: &Path) -> Result<BTreeSet<String>> {
    let patch = fs::read_to_string(path).map_err(|e| Error::IoRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(changed_paths(&patch))
}

/// Whether `declared` is `path` itself or a directory containing it
pub fn declares(declared: &str, path: &str) -> bool {
    declared == path
        || (path.len() > declared.len()
            && path.starts_with(declared)
            && path.as_bytes()[declared.len()] == b'/')
}

/// Fail on the first changed path no declared path covers
pub fn check_declared<'a>(
    changed: impl IntoIterator<Item = &'a String>,
    declared: &BTreeSet<String>,
) -> Result<()> {
    for path in changed {
        if !declared.iter().any(|d| declares(d, path)) {
            return Err(Error::UndeclaredPath { path: path.clone() });
        }
    }
    Ok(())
}

/// `-a,b +c,d @@`: line counts of the old and new side
fn hunk_counts(range: &str) -> (usize, usize) {
    let count = |spec: Option<&str>| -> usize {
        match spec.and_then(|s| s.split_once(',')) {
            Some((_, n)) => n.parse().unwrap_or(0),
            None => 1,
        }
    };
    let mut parts = range.split_whitespace();
    let old = count(parts.next().and_then(|s| s.strip_prefix('-')));
    let new = count(parts.next().and_then(|s| s.strip_prefix('+')));
    (old, new)
}

/// `a/<path> b/<path>`; renames carry their paths on separate lines
fn git_header_path(rest: &str) -> Option<String> {
    if rest.starts_with('"') {
        let (old, _) = rest.split_once("\" \"")?;
        return Some(strip_component(&unquote(&format!("{}\"", old))));
    }
    let rest = rest.strip_prefix("a/")?;
    rest.match_indices(" b/")
        .map(|(idx, _)| (&rest[..idx], &rest[idx + 3..]))
        .find(|(old, new)| old == new)
        .map(|(old, _)| old.to_string())
}

/// `---`/`+++` name, without the timestamp some tools append
fn header_path(rest: &str) -> Option<String> {
    let name = unquote(rest.split('\t').next().unwrap_or_default().trim_end());
    if name == "/dev/null" {
        return None;
    }
    Some(strip_component(&name))
}

/// Drop the leading `a/` or `b/` component, as `git apply -p1` does
fn strip_component(name: &str) -> String {
    match name.split_once('/') {
        Some((_, rest)) => rest.to_string(),
        None => name.to_string(),
    }
}

fn unquote(name: &str) -> String {
    let Some(inner) = name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) else {
        return name.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
