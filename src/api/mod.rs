//! Coordinator API
//!
//! The coordinator serves its operations over WebSocket; the CLI's client
//! commands talk to it through [`ApiClient`].

mod client;
mod server;

pub use client::{ApiClient, ClientConfig};
pub use server::ApiServer;
