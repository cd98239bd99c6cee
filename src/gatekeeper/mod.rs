//! Gatekeeping pipeline
//!
//! Everything between a submitted request and its final ledger entry:
//! - `store`: durable log of submitted requests
//! - `tracker`: in-flight requests and their admission waiters
//! - `executor`: the serialized write critical section
//! - `coordinator`: admission, scheduling, gating and cancellation
//! - `recovery`: restart handling for interrupted requests

mod coordinator;
mod executor;
mod recovery;
mod store;
mod tracker;

pub use coordinator::{Components, Coordinator};
