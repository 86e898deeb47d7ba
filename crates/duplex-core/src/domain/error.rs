//! Error taxonomy for call sessions.

use std::time::Duration;

use super::call_state::CallState;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Requested call-state transition is not in the legality table.
    #[error("invalid call state change from {from} to {to}")]
    InvalidStateChange { from: CallState, to: CallState },

    /// Offer/answer creation or a description could not be applied.
    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("connection not established within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("peer connection failed")]
    ConnectionFailed,

    /// Integration error, e.g. an operation issued before setup.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    pub(crate) fn negotiation(step: &str, err: impl std::fmt::Display) -> Self {
        Self::NegotiationFailure(format!("{step}: {err}"))
    }
}
