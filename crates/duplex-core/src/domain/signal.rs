//! Signal payloads: the engine's only wire contract.
//!
//! Carried as opaque bytes by the signaling channel and encoded with a
//! [`SignalCodec`](crate::application::ports::SignalCodec).

use serde::{Deserialize, Serialize};

use super::peer::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMessage {
    Description(SessionDescription),
    Candidate(IceCandidate),
}
