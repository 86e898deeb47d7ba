//! Port traits (interfaces) that the negotiation core depends on.
//!
//! Adapters implement these traits; the engine never references Quinn, a
//! native WebRTC stack, or a UI toolkit directly.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::domain::error::CallError;
use crate::domain::identity::{PeerId, TrackOrigin};
use crate::domain::media::{EncodingParameters, MediaKind, TransportStats};
use crate::domain::peer::{
    DataChannelConfig, IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints,
    PeerConnectionState, RtcConfiguration, SessionDescription, SignalingState,
};
use crate::domain::signal::SignalMessage;

// ---------------------------------------------------------------------------
// Peer connection (native WebRTC abstraction)
// ---------------------------------------------------------------------------

/// Callbacks raised by a [`PeerConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerConnectionEvent {
    SignalingStateChanged(SignalingState),
    IceGatheringStateChanged(IceGatheringState),
    IceConnectionStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    /// A local candidate was gathered and should be sent to the remote peer.
    IceCandidateGenerated(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    RemoteTrackAdded { kind: MediaKind, track_id: String },
    RemoteTrackRemoved { kind: MediaKind, track_id: String },
    DataChannelOpened { label: String },
}

/// Receives [`PeerConnectionEvent`]s. Implementations must not block.
pub trait PeerConnectionObserver: Send + Sync {
    fn on_event(&self, event: PeerConnectionEvent);
}

/// One native peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, constraints: MediaConstraints)
        -> anyhow::Result<SessionDescription>;

    async fn create_answer(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;

    fn add_track(&self, kind: MediaKind, track_id: &str) -> anyhow::Result<()>;

    fn remove_track(&self, kind: MediaKind) -> anyhow::Result<()>;

    fn signaling_state(&self) -> SignalingState;
    fn ice_gathering_state(&self) -> IceGatheringState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn connection_state(&self) -> PeerConnectionState;

    fn local_description(&self) -> Option<SessionDescription>;
    fn remote_description(&self) -> Option<SessionDescription>;

    /// Current encodings of the sender for `kind`, `None` if no such sender.
    fn sender_parameters(&self, kind: MediaKind) -> Option<EncodingParameters>;

    fn set_sender_parameters(
        &self,
        kind: MediaKind,
        params: EncodingParameters,
    ) -> anyhow::Result<()>;

    /// Cumulative outbound counters for `kind`; `None` when unavailable.
    async fn transport_stats(&self, kind: MediaKind) -> Option<TransportStats>;

    fn create_data_channel(&self, label: &str, config: &DataChannelConfig) -> anyhow::Result<()>;

    fn close(&self);
}

/// Creates peer connections wired to an observer.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

// ---------------------------------------------------------------------------
// Signaling channel
// ---------------------------------------------------------------------------

/// Inbound notifications from the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Signal {
        payload: Bytes,
        from: PeerId,
        is_polite: bool,
    },
    IceCandidate {
        payload: Bytes,
        from: PeerId,
    },
    EndCall {
        from: PeerId,
    },
    PeerUnavailable {
        peer: PeerId,
    },
    SocketOpened,
    SocketClosed,
}

pub trait SignalingObserver: Send + Sync {
    fn on_event(&self, event: SignalingEvent);
}

/// Reliable, ordered, per-destination delivery of opaque messages.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Connect and register; returns our peer id.
    async fn connect(&self, observer: Arc<dyn SignalingObserver>) -> anyhow::Result<PeerId>;

    async fn send_signal(&self, payload: Bytes, to: PeerId) -> anyhow::Result<()>;

    async fn send_ice_candidate(&self, payload: Bytes, to: PeerId) -> anyhow::Result<()>;

    async fn send_end_call(&self, to: PeerId) -> anyhow::Result<()>;

    fn disconnect(&self);
}

/// Encodes / decodes [`SignalMessage`]s to/from bytes (e.g. CBOR).
pub trait SignalCodec: Send + Sync {
    fn encode(&self, msg: &SignalMessage) -> anyhow::Result<Bytes>;
    fn decode(&self, data: &[u8]) -> anyhow::Result<SignalMessage>;
}

// ---------------------------------------------------------------------------
// Network path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
}

/// Reports whether the device currently has a usable network path.
pub trait NetworkPathMonitor: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<PathStatus>;
}

// ---------------------------------------------------------------------------
// Call events (UI bridge)
// ---------------------------------------------------------------------------

/// Emits call lifecycle events toward the call UI.
///
/// Callbacks run on the session task and are awaited before the next event
/// is handled. An implementation must not await a [`CallManager`] method
/// from inside a callback: the reply would need the session task it is
/// blocking. Hand the event off (e.g. over a channel) and act on it
/// elsewhere.
///
/// [`CallManager`]: super::call_manager::CallManager
#[async_trait]
pub trait CallEvents: Send + Sync {
    async fn offer_received(&self, from: PeerId);
    async fn peer_accepted(&self, peer: PeerId);
    async fn call_started(&self, peer: PeerId);
    /// Emitted exactly once per call; `error` is set when the call failed.
    async fn call_ended(&self, peer: Option<PeerId>, error: Option<&CallError>);
    async fn peer_connection_lost(&self, peer: PeerId);
    async fn data_channel_received(&self, label: &str);
    async fn track_added(&self, origin: TrackOrigin, kind: MediaKind);
    async fn track_removed(&self, origin: TrackOrigin, kind: MediaKind);
}
