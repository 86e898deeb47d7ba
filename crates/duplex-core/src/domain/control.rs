//! Relay control-plane messages.
//!
//! These travel over the reliable QUIC bidirectional stream between a client
//! and the signaling relay, encoded as CBOR. Signal and candidate payloads are
//! opaque to the relay. Pure data, no I/O.

use serde::{Deserialize, Serialize};

use super::identity::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMsg {
    // -- Handshake --
    Hello {
        client_version: String,
    },
    Welcome {
        peer_id: PeerId,
    },

    // -- Routed messages --
    //
    // `peer_id` is the destination when a client sends the message and the
    // origin when the relay delivers it.
    Signal {
        peer_id: PeerId,
        payload: Vec<u8>,
        /// Set by the relay: whether the *recipient* is the polite side.
        is_polite: bool,
    },
    IceCandidate {
        peer_id: PeerId,
        payload: Vec<u8>,
    },
    EndCall {
        peer_id: PeerId,
    },

    /// Destination of a routed message is not connected.
    PeerUnavailable {
        peer_id: PeerId,
    },
}

impl ControlMsg {
    /// Rewrites the routing field from destination to origin.
    pub fn routed_from(self, from: PeerId) -> Self {
        match self {
            Self::Signal { peer_id, payload, .. } => Self::Signal {
                peer_id: from,
                payload,
                is_polite: is_polite(peer_id, from),
            },
            Self::IceCandidate { payload, .. } => Self::IceCandidate {
                peer_id: from,
                payload,
            },
            Self::EndCall { .. } => Self::EndCall { peer_id: from },
            other => other,
        }
    }

    /// Destination of a client-sent routed message.
    pub fn destination(&self) -> Option<PeerId> {
        match self {
            Self::Signal { peer_id, .. }
            | Self::IceCandidate { peer_id, .. }
            | Self::EndCall { peer_id } => Some(*peer_id),
            _ => None,
        }
    }
}

/// Politeness rule shared by every signaling implementation: within a pair
/// the peer with the larger id is polite, so the two sides always disagree.
pub fn is_polite(recipient: PeerId, sender: PeerId) -> bool {
    recipient > sender
}
