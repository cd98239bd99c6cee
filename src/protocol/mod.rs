//! Coordinator API protocol
//!
//! JSON envelopes over WebSocket with a `type` discriminator and a
//! protocol version on every message.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
