//! [`CallEvents`] implementations that do not need a UI.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::application::ports::CallEvents;
use crate::domain::error::CallError;
use crate::domain::identity::{PeerId, TrackOrigin};
use crate::domain::media::MediaKind;

/// Logs every call event through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingCallEvents;

#[async_trait]
impl CallEvents for LoggingCallEvents {
    async fn offer_received(&self, from: PeerId) {
        info!(%from, "Incoming call");
    }

    async fn peer_accepted(&self, peer: PeerId) {
        info!(%peer, "Peer accepted");
    }

    async fn call_started(&self, peer: PeerId) {
        info!(%peer, "Call started");
    }

    async fn call_ended(&self, peer: Option<PeerId>, error: Option<&CallError>) {
        match error {
            Some(e) => info!(?peer, "Call ended: {e}"),
            None => info!(?peer, "Call ended"),
        }
    }

    async fn peer_connection_lost(&self, peer: PeerId) {
        info!(%peer, "Connection lost; reconnecting");
    }

    async fn data_channel_received(&self, label: &str) {
        info!(label, "Data channel received");
    }

    async fn track_added(&self, origin: TrackOrigin, kind: MediaKind) {
        info!(?origin, %kind, "Track added");
    }

    async fn track_removed(&self, origin: TrackOrigin, kind: MediaKind) {
        info!(?origin, %kind, "Track removed");
    }
}

/// A call event as seen by [`RecordingCallEvents`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    OfferReceived(PeerId),
    PeerAccepted(PeerId),
    CallStarted(PeerId),
    /// The error is kept as its display string.
    CallEnded(Option<PeerId>, Option<String>),
    PeerConnectionLost(PeerId),
    DataChannelReceived(String),
    TrackAdded(TrackOrigin, MediaKind),
    TrackRemoved(TrackOrigin, MediaKind),
}

/// Keeps every event in order; used by tests and demos.
#[derive(Debug, Default)]
pub struct RecordingCallEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingCallEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&RecordedEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: RecordedEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl CallEvents for RecordingCallEvents {
    async fn offer_received(&self, from: PeerId) {
        self.push(RecordedEvent::OfferReceived(from));
    }

    async fn peer_accepted(&self, peer: PeerId) {
        self.push(RecordedEvent::PeerAccepted(peer));
    }

    async fn call_started(&self, peer: PeerId) {
        self.push(RecordedEvent::CallStarted(peer));
    }

    async fn call_ended(&self, peer: Option<PeerId>, error: Option<&CallError>) {
        self.push(RecordedEvent::CallEnded(peer, error.map(ToString::to_string)));
    }

    async fn peer_connection_lost(&self, peer: PeerId) {
        self.push(RecordedEvent::PeerConnectionLost(peer));
    }

    async fn data_channel_received(&self, label: &str) {
        self.push(RecordedEvent::DataChannelReceived(label.to_string()));
    }

    async fn track_added(&self, origin: TrackOrigin, kind: MediaKind) {
        self.push(RecordedEvent::TrackAdded(origin, kind));
    }

    async fn track_removed(&self, origin: TrackOrigin, kind: MediaKind) {
        self.push(RecordedEvent::TrackRemoved(origin, kind));
    }
}
