#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use duplex_core::adapters::call_events::{RecordedEvent, RecordingCallEvents};
use duplex_core::adapters::loopback::peer_connection::{
    LoopbackPeerConnection, LoopbackPeerConnectionFactory,
};
use duplex_core::adapters::loopback::signaling::{
    InMemorySignalingChannel, InMemorySignalingHub, RoutedKind,
};
use duplex_core::adapters::path_monitor::ManualPathMonitor;
use duplex_core::adapters::signal_codec::CborSignalCodec;
use duplex_core::application::ports::{
    CallEvents, NetworkPathMonitor, SignalCodec, SignalingChannel, SignalingEvent,
    SignalingObserver,
};
use duplex_core::domain::peer::{SdpType, SessionDescription};
use duplex_core::domain::signal::SignalMessage;
use duplex_core::{CallManager, EngineDeps, PeerId, SessionConfig};

/// One engine-backed endpoint on a hub.
pub struct Peer {
    pub id: PeerId,
    pub manager: CallManager,
    pub events: Arc<RecordingCallEvents>,
    pub factory: Arc<LoopbackPeerConnectionFactory>,
}

impl Peer {
    pub fn pc(&self) -> Arc<LoopbackPeerConnection> {
        self.factory.last_created().expect("no peer connection yet")
    }

    pub fn saw(&self, event: &RecordedEvent) -> bool {
        self.events.events().contains(event)
    }

    pub fn count(&self, event: &RecordedEvent) -> usize {
        self.events.count(|e| e == event)
    }
}

pub async fn peer(hub: &Arc<InMemorySignalingHub>, auto_connect: bool) -> Peer {
    peer_with_config(hub, auto_connect, SessionConfig::default()).await
}

pub async fn peer_with_config(
    hub: &Arc<InMemorySignalingHub>,
    auto_connect: bool,
    config: SessionConfig,
) -> Peer {
    spawn_peer(hub, auto_connect, config, None).await
}

/// A peer whose network path is driven by the returned monitor.
pub async fn peer_with_path(hub: &Arc<InMemorySignalingHub>) -> (Peer, Arc<ManualPathMonitor>) {
    let path = Arc::new(ManualPathMonitor::new());
    let monitor: Arc<dyn NetworkPathMonitor> = path.clone();
    let peer = spawn_peer(hub, true, SessionConfig::default(), Some(monitor)).await;
    (peer, path)
}

async fn spawn_peer(
    hub: &Arc<InMemorySignalingHub>,
    auto_connect: bool,
    config: SessionConfig,
    path: Option<Arc<dyn NetworkPathMonitor>>,
) -> Peer {
    let factory = Arc::new(LoopbackPeerConnectionFactory::new(auto_connect));
    let events = Arc::new(RecordingCallEvents::new());
    let delegate: Arc<dyn CallEvents> = events.clone();
    let manager = CallManager::spawn(
        config,
        EngineDeps {
            factory: factory.clone(),
            signaling: Arc::new(hub.channel()),
            codec: Arc::new(CborSignalCodec),
        },
        &delegate,
        path,
    )
    .expect("valid config");
    let id = manager.connect().await.expect("connect");
    Peer {
        id,
        manager,
        events,
        factory,
    }
}

/// Poll `cond` until it holds, failing after a few seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Decoded descriptions `from` sent through the hub, in order.
pub fn descriptions_from(hub: &InMemorySignalingHub, from: PeerId) -> Vec<SessionDescription> {
    hub.routed()
        .into_iter()
        .filter(|m| m.from == from && m.kind == RoutedKind::Signal)
        .filter_map(|m| match CborSignalCodec.decode(&m.payload) {
            Ok(SignalMessage::Description(desc)) => Some(desc),
            _ => None,
        })
        .collect()
}

pub fn count_of(descs: &[SessionDescription], sdp_type: SdpType) -> usize {
    descs.iter().filter(|d| d.sdp_type == sdp_type).count()
}

pub fn ufrag(sdp: &str) -> Option<&str> {
    sdp.lines().find_map(|l| l.strip_prefix("a=ice-ufrag:"))
}

// ---------------------------------------------------------------------------
// Scripted remote endpoint
// ---------------------------------------------------------------------------

struct Forward(mpsc::UnboundedSender<SignalingEvent>);

impl SignalingObserver for Forward {
    fn on_event(&self, event: SignalingEvent) {
        let _ = self.0.send(event);
    }
}

/// A raw hub endpoint driven by the test, speaking the signal codec.
pub struct Scripted {
    pub id: PeerId,
    pub channel: InMemorySignalingChannel,
    pub inbox: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl Scripted {
    pub async fn connect(hub: &Arc<InMemorySignalingHub>) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let channel = hub.channel();
        let id = channel.connect(Arc::new(Forward(tx))).await.expect("connect");
        Self { id, channel, inbox }
    }

    pub async fn send(&self, msg: SignalMessage, to: PeerId) {
        let payload = CborSignalCodec.encode(&msg).expect("encode");
        match msg {
            SignalMessage::Description(_) => self.channel.send_signal(payload, to).await,
            SignalMessage::Candidate(_) => self.channel.send_ice_candidate(payload, to).await,
        }
        .expect("send");
    }

    /// Next inbound description, skipping everything else.
    pub async fn next_description(&mut self) -> SessionDescription {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
                .await
                .expect("timed out")
                .expect("hub dropped");
            if let SignalingEvent::Signal { payload, .. } = event {
                if let Ok(SignalMessage::Description(desc)) = CborSignalCodec.decode(&payload) {
                    return desc;
                }
            }
        }
    }

    /// Drain the inbox and report whether an end call from `from` arrived.
    pub fn received_end_call(&mut self, from: PeerId) -> bool {
        let mut found = false;
        while let Ok(event) = self.inbox.try_recv() {
            if event == (SignalingEvent::EndCall { from }) {
                found = true;
            }
        }
        found
    }
}
