//! Protocol versioning
//!
//! Every API envelope carries the sender's protocol version; the server
//! refuses clients whose major version differs.

use serde::{Deserialize, Serialize};

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// Version spoken by this build
    pub const CURRENT: ProtocolVersion = ProtocolVersion::new(1, 1, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// A server at `self` can serve a client at `client` when the majors
    /// agree and the server knows at least the client's minor revision.
    pub fn can_serve(&self, client: &ProtocolVersion) -> bool {
        self.major == client.major && self.minor >= client.minor
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(ProtocolVersion::new(1, 2, 3).to_string(), "1.2.3");
    }

    #[test]
    fn test_can_serve() {
        let server = ProtocolVersion::new(1, 1, 0);

        assert!(server.can_serve(&ProtocolVersion::new(1, 0, 4)));
        assert!(server.can_serve(&ProtocolVersion::new(1, 1, 9)));
        assert!(!server.can_serve(&ProtocolVersion::new(1, 2, 0)));
        assert!(!server.can_serve(&ProtocolVersion::new(2, 0, 0)));
    }
}
