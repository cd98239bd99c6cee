//! Core domain types for the commit gatekeeper
//!
//! Requests, their lifecycle states and quality-gate results. These are the
//! records persisted to disk and exchanged over the API.

mod gate;
mod request;
mod state;

pub use gate::*;
pub use request::*;
pub use state::*;
