//! CliCallEvents: implements the [`CallEvents`] port for the terminal.
//!
//! Logging is delegated to [`LoggingCallEvents`]; the events the command loop
//! reacts to are forwarded over a channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use duplex_core::adapters::call_events::LoggingCallEvents;
use duplex_core::application::ports::CallEvents;
use duplex_core::domain::identity::{PeerId, TrackOrigin};
use duplex_core::domain::media::MediaKind;
use duplex_core::CallError;

/// Events the command loop acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Incoming(PeerId),
    Started(PeerId),
    Ended { failed: bool },
}

pub struct CliCallEvents {
    log: LoggingCallEvents,
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl CliCallEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                log: LoggingCallEvents,
                tx,
            },
            rx,
        )
    }

    fn forward(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl CallEvents for CliCallEvents {
    async fn offer_received(&self, from: PeerId) {
        self.log.offer_received(from).await;
        self.forward(UiEvent::Incoming(from));
    }

    async fn peer_accepted(&self, peer: PeerId) {
        self.log.peer_accepted(peer).await;
    }

    async fn call_started(&self, peer: PeerId) {
        self.log.call_started(peer).await;
        self.forward(UiEvent::Started(peer));
    }

    async fn call_ended(&self, peer: Option<PeerId>, error: Option<&CallError>) {
        self.log.call_ended(peer, error).await;
        self.forward(UiEvent::Ended {
            failed: error.is_some(),
        });
    }

    async fn peer_connection_lost(&self, peer: PeerId) {
        self.log.peer_connection_lost(peer).await;
    }

    async fn data_channel_received(&self, label: &str) {
        self.log.data_channel_received(label).await;
    }

    async fn track_added(&self, origin: TrackOrigin, kind: MediaKind) {
        self.log.track_added(origin, kind).await;
    }

    async fn track_removed(&self, origin: TrackOrigin, kind: MediaKind) {
        self.log.track_removed(origin, kind).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_only_loop_events() {
        let (events, mut rx) = CliCallEvents::new();
        events.offer_received(PeerId(1)).await;
        events.peer_accepted(PeerId(1)).await;
        events.call_started(PeerId(1)).await;
        events
            .call_ended(Some(PeerId(1)), Some(&CallError::ConnectionFailed))
            .await;

        assert_eq!(rx.recv().await, Some(UiEvent::Incoming(PeerId(1))));
        assert_eq!(rx.recv().await, Some(UiEvent::Started(PeerId(1))));
        assert_eq!(rx.recv().await, Some(UiEvent::Ended { failed: true }));
        assert!(rx.try_recv().is_err());
    }
}
