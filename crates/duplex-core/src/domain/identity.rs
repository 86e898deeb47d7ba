//! Domain identifiers.
//!
//! These are **pure data**, no I/O, no framework dependencies.

use serde::{Deserialize, Serialize};

/// Peer identifier assigned by the signaling channel on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Where a media track lives relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackOrigin {
    Local,
    Remote,
}
