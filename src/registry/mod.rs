//! Protected-resource registry and approval records
//!
//! The registry is a data-driven ownership table: each protected path or
//! glob pattern has exactly one owner. Approvals let an owner authorize
//! another worker to change one of their resources.

mod approvals;
mod resources;

use std::sync::Arc;

use parking_lot::RwLock;

pub use approvals::{Approval, ApprovalGrant, ApprovalStore};
pub use resources::{ProtectedResource, ResourceRegistry};

/// Registry shared between the validator, the gatekeeper and `reload`
pub type SharedRegistry = Arc<RwLock<ResourceRegistry>>;

/// Approvals shared between the validator and the API
pub type SharedApprovals = Arc<RwLock<ApprovalStore>>;

/// Glob options: `*` does not cross `/`, `**` does, case matters
pub(crate) fn match_options() -> glob::MatchOptions {
    glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Whether `pattern` covers `path`: it matches the path itself or one of
/// the directories containing it
pub(crate) fn covers(pattern: &glob::Pattern, path: &str) -> bool {
    let opts = match_options();
    if pattern.matches_with(path, opts) {
        return true;
    }
    path.match_indices('/')
        .any(|(idx, _)| pattern.matches_with(&path[..idx], opts))
}
