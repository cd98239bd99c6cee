//! Protected-resource mapping file
//!
//! ```toml
//! [[resource]]
//! pattern = "core/main"
//! owner = "w1"
//! description = "Main entry point"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::covers;
use crate::error::{Error, Result};
use crate::types::WorkerId;

/// A protected path or pattern with its single owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResource {
    pub pattern: String,
    pub owner: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "resource")]
    resources: Vec<ProtectedResource>,
}

#[derive(Debug, Clone)]
struct Entry {
    resource: ProtectedResource,
    matcher: glob::Pattern,
}

/// Ownership table loaded from the mapping file
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    entries: Vec<Entry>,
    path: Option<PathBuf>,
}

impl ResourceRegistry {
    /// Build a registry, validating every pattern and owner
    pub fn from_resources(resources: Vec<ProtectedResource>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(resources.len());

        for resource in resources {
            let pattern = resource.pattern.trim();
            if pattern.is_empty() {
                return Err(Error::registry("resource with an empty pattern"));
            }
            if pattern.starts_with('/') || pattern.split('/').any(|s| s == "..") {
                return Err(Error::registry(format!(
                    "pattern '{}' must be relative and must not contain '..'",
                    pattern
                )));
            }
            if resource.owner.trim().is_empty() {
                return Err(Error::registry(format!("pattern '{}' has no owner", pattern)));
            }
            if !seen.insert(pattern.to_string()) {
                return Err(Error::registry(format!(
                    "pattern '{}' is listed more than once; each resource has exactly one owner",
                    pattern
                )));
            }

            let matcher = glob::Pattern::new(pattern).map_err(|e| {
                Error::registry(format!("invalid pattern '{}': {}", pattern, e))
            })?;

            entries.push(Entry {
                resource: ProtectedResource {
                    pattern: pattern.to_string(),
                    ..resource
                },
                matcher,
            });
        }

        Ok(Self { entries, path: None })
    }

    /// Load the mapping file. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Registry file not found, no resources are protected");
                String::new()
            }
            Err(e) => {
                return Err(Error::IoRead {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let file: RegistryFile = toml::from_str(&content).map_err(|e| Error::Registry {
            message: e.to_string(),
            path: Some(path.to_path_buf()),
        })?;

        let mut registry = Self::from_resources(file.resources).map_err(|e| match e {
            Error::Registry { message, .. } => Error::Registry {
                message,
                path: Some(path.to_path_buf()),
            },
            other => other,
        })?;
        registry.path = Some(path.to_path_buf());

        tracing::info!(path = %path.display(), resources = registry.len(), "Protected-resource registry loaded");
        Ok(registry)
    }

    /// Rewrite the mapping file (write to a sibling file, then rename)
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = RegistryFile {
            resources: self.resources().cloned().collect(),
        };
        let content = toml::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content).map_err(|e| Error::IoWrite {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, path).map_err(|e| Error::IoWrite {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ProtectedResource> {
        self.entries.iter().map(|e| &e.resource)
    }

    /// Resource registered under exactly this pattern
    pub fn get(&self, pattern: &str) -> Option<&ProtectedResource> {
        self.entries
            .iter()
            .find(|e| e.resource.pattern == pattern)
            .map(|e| &e.resource)
    }

    /// Every resource covering `path`
    pub fn matching(&self, path: &str) -> Vec<&ProtectedResource> {
        self.entries
            .iter()
            .filter(|e| covers(&e.matcher, path))
            .map(|e| &e.resource)
            .collect()
    }

    /// Resources covering `path` plus those that may lie inside it when
    /// `path` names a directory
    pub fn touching(&self, path: &str) -> Vec<&ProtectedResource> {
        self.entries
            .iter()
            .filter(|e| covers(&e.matcher, path) || inside(&e.resource.pattern, path))
            .map(|e| &e.resource)
            .collect()
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.entries.iter().any(|e| covers(&e.matcher, path))
    }

    /// Hand a resource to a new owner; returns the previous owner
    pub fn transfer(&mut self, pattern: &str, new_owner: &str) -> Result<WorkerId> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.resource.pattern == pattern)
            .ok_or_else(|| Error::registry(format!("pattern '{}' is not protected", pattern)))?;

        let previous = std::mem::replace(&mut entry.resource.owner, new_owner.to_string());
        tracing::info!(pattern, from = %previous, to = new_owner, "Ownership transferred");
        Ok(previous)
    }
}

/// Whether the literal prefix of a pattern lies below directory `dir`.
/// Patterns starting with a wildcard only apply to paths they cover.
fn inside(pattern: &str, dir: &str) -> bool {
    let literal = match pattern.find(['*', '?', '[']) {
        Some(0) => return false,
        Some(idx) => &pattern[..idx],
        None => pattern,
    };
    literal.len() > dir.len() && literal.starts_with(dir) && literal.as_bytes()[dir.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn res(pattern: &str, owner: &str) -> ProtectedResource {
        ProtectedResource {
            pattern: pattern.into(),
            owner: owner.into(),
            description: None,
        }
    }

    #[test]
    fn test_matching_returns_all_covering_resources() {
        let reg = ResourceRegistry::from_resources(vec![
            res("core/main", "w1"),
            res("core/*", "lead"),
            res("docs", "w3"),
        ])
        .unwrap();

        let owners: Vec<_> = reg.matching("core/main").iter().map(|r| r.owner.clone()).collect();
        assert_eq!(owners, vec!["w1", "lead"]);
        assert!(reg.matching("src/lib.rs").is_empty());
        assert!(reg.is_protected("docs/guide.md"));
    }

    #[test]
    fn test_touching_includes_resources_inside_a_directory() {
        let reg = ResourceRegistry::from_resources(vec![
            res("src/core", "w1"),
            res("src/gen*/out", "w2"),
            res("**/secret", "w3"),
            res("docs", "w4"),
        ])
        .unwrap();

        let owners = |path: &str| -> Vec<String> { reg.touching(path).iter().map(|r| r.owner.clone()).collect() };
        assert_eq!(owners("src"), vec!["w1", "w2"]);
        assert_eq!(owners("src/core/lib.rs"), vec!["w1"]);
        assert_eq!(owners("docs/secret"), vec!["w3", "w4"]);
        assert!(owners("srcs").is_empty());
        assert!(reg.matching("src").is_empty());
    }

    #[test]
    fn test_duplicate_pattern_rejected() {
        let err = ResourceRegistry::from_resources(vec![res("core", "w1"), res("core", "w2")]).unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
    }

    #[test]
    fn test_invalid_entries_rejected() {
        assert!(ResourceRegistry::from_resources(vec![res("", "w1")]).is_err());
        assert!(ResourceRegistry::from_resources(vec![res("core", " ")]).is_err());
        assert!(ResourceRegistry::from_resources(vec![res("/etc", "w1")]).is_err());
        assert!(ResourceRegistry::from_resources(vec![res("a/../b", "w1")]).is_err());
        assert!(ResourceRegistry::from_resources(vec![res("src/[", "w1")]).is_err());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let reg = ResourceRegistry::load(&dir.path().join("registry.toml")).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_transfer_and_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.toml");
        fs::write(
            &path,
            "[[resource]]\npattern = \"core/main\"\nowner = \"w1\"\ndescription = \"entry\"\n",
        )
        .unwrap();

        let mut reg = ResourceRegistry::load(&path).unwrap();
        assert_eq!(reg.transfer("core/main", "w2").unwrap(), "w1");
        reg.save().unwrap();

        let reloaded = ResourceRegistry::load(&path).unwrap();
        let resource = reloaded.get("core/main").unwrap();
        assert_eq!(resource.owner, "w2");
        assert_eq!(resource.description.as_deref(), Some("entry"));
    }

    #[test]
    fn test_transfer_unknown_pattern() {
        let mut reg = ResourceRegistry::from_resources(vec![res("core", "w1")]).unwrap();
        assert!(reg.transfer("other", "w2").is_err());
    }
}
