//! Session actor: the single serialized execution context of one call.
//!
//! Every mutation of call state goes through [`SessionEvent`]s posted onto
//! one unbounded queue: user commands, signaling and peer-connection
//! callbacks, network path changes, bitrate ticks and timeout firings. The
//! actor task owns the [`NegotiationEngine`] and handles events strictly in
//! arrival order.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::domain::error::CallError;
use crate::domain::identity::PeerId;
use crate::domain::peer::DataChannelConfig;

use super::negotiation::NegotiationEngine;
use super::ports::{
    PathStatus, PeerConnectionEvent, PeerConnectionObserver, SignalingEvent, SignalingObserver,
};

pub type SessionQueue = mpsc::UnboundedSender<SessionEvent>;

pub type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Which bitrate ticker fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentLoop {
    Fast,
    Slow,
}

#[derive(Debug)]
pub enum SessionEvent {
    Command(CallCommand),
    Signaling(SignalingEvent),
    PeerConnection(PeerConnectionEvent),
    NetworkPath(PathStatus),
    BitrateTick(AdjustmentLoop),
    /// Fired by the Connecting watchdog; stale attempts are ignored.
    ConnectionTimeout { attempt: u64 },
}

/// User / call-UI intents, answered through a oneshot reply.
#[derive(Debug)]
pub enum CallCommand {
    Connect {
        reply: Reply<PeerId>,
    },
    StartCall {
        to: PeerId,
        video: bool,
        reply: Reply<()>,
    },
    AnswerCall {
        video: bool,
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    SetVideoEnabled {
        enabled: bool,
        reply: Reply<()>,
    },
    OpenDataChannel {
        label: String,
        config: DataChannelConfig,
        reply: Reply<()>,
    },
    RestartIce {
        reply: Reply<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Forwards adapter callbacks into the session queue.
#[derive(Clone)]
pub struct QueueObserver {
    queue: SessionQueue,
}

impl QueueObserver {
    pub fn new(queue: SessionQueue) -> Self {
        Self { queue }
    }

    fn post(&self, event: SessionEvent) {
        if self.queue.send(event).is_err() {
            debug!("Session queue closed; dropping callback");
        }
    }
}

impl PeerConnectionObserver for QueueObserver {
    fn on_event(&self, event: PeerConnectionEvent) {
        self.post(SessionEvent::PeerConnection(event));
    }
}

impl SignalingObserver for QueueObserver {
    fn on_event(&self, event: SignalingEvent) {
        self.post(SessionEvent::Signaling(event));
    }
}

/// Run the actor loop until shutdown or until every queue sender is gone.
pub async fn run_session(
    mut engine: NegotiationEngine,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    info!("Call session started");
    while let Some(event) = events.recv().await {
        if let SessionEvent::Command(CallCommand::Shutdown { done }) = event {
            engine.shutdown().await;
            let _ = done.send(());
            break;
        }
        engine.handle_event(event).await;
    }
    info!("Call session stopped");
}
