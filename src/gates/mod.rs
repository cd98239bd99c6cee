//! Quality gates
//!
//! Pluggable checks (tests, linters, coverage) run before a request may
//! enter the write critical section.

mod command;
mod fixed;
mod runner;
mod traits;
mod worktree;

pub use command::{parse_percentage, CommandCheck, CoverageCheck};
pub use fixed::StaticCheck;
pub use runner::GateRunner;
pub use traits::{CheckContext, CheckVerdict, QualityCheck};
pub use worktree::Worktrees;
