//! High-level call lifecycle.
//!
//! The legality table lives in [`CallState::can_transition_to`]; the
//! [`CallStateMachine`] wraps one state behind a single-writer lock so the
//! session actor can mutate it while handles read it from other tasks.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    SendingRequest,
    ReceivingRequest,
    Connecting,
    Running,
    Ending,
}

impl CallState {
    pub const ALL: [CallState; 6] = [
        CallState::Idle,
        CallState::SendingRequest,
        CallState::ReceivingRequest,
        CallState::Connecting,
        CallState::Running,
        CallState::Ending,
    ];

    /// Whether `self -> to` is in the legality table. Self-transitions are
    /// handled by the machine, not here.
    pub fn can_transition_to(self, to: CallState) -> bool {
        use CallState::*;
        match to {
            Idle => matches!(self, Ending),
            Running => matches!(self, Connecting),
            // No call waiting: a new request only starts from Idle.
            ReceivingRequest | SendingRequest => matches!(self, Idle),
            Ending => matches!(self, Running | SendingRequest | ReceivingRequest | Connecting),
            Connecting => matches!(self, SendingRequest | ReceivingRequest | Running),
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Holds the current [`CallState`] for one session.
#[derive(Debug)]
pub struct CallStateMachine {
    state: RwLock<CallState>,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CallState::Idle),
        }
    }

    pub fn state(&self) -> CallState {
        *self.state.read()
    }

    pub fn can_change_state(&self, to: CallState) -> bool {
        let from = self.state();
        from == to || from.can_transition_to(to)
    }

    /// Move to `to`, or fail with [`CallError::InvalidStateChange`] leaving
    /// the state untouched. `to == current` is accepted as a no-op.
    pub fn change_state(&self, to: CallState) -> Result<(), CallError> {
        let mut state = self.state.write();
        let from = *state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(CallError::InvalidStateChange { from, to });
        }
        *state = to;
        debug!(%from, %to, "Call state changed");
        Ok(())
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
