//! Shared repository backends
//!
//! Only the gatekeeper's executor holds a repository; everything else sees
//! the published [`RepoSnapshot`].

pub mod diff;
mod git;
mod memory;
mod traits;

pub use git::GitRepository;
pub use memory::{Fault, FaultInjector, MemoryRepository};
pub use traits::*;

use std::path::Path;

use crate::config::{RepositoryBackend, RepositorySettings};
use crate::error::Result;

/// Create the configured backend. A memory repository with a `journal`
/// path is replayed from it and keeps it current.
pub fn open(settings: &RepositorySettings, journal: Option<&Path>, fsync: bool) -> Result<Box<dyn Repository>> {
    Ok(match (settings.backend, journal) {
        (RepositoryBackend::Memory, Some(path)) => {
            Box::new(MemoryRepository::open(&settings.main_branch, path, fsync)?)
        }
        (RepositoryBackend::Memory, None) => Box::new(MemoryRepository::new(&settings.main_branch)),
        (RepositoryBackend::Git, _) => Box::new(GitRepository::new(settings)),
    })
}
