//! In-process signaling relay.
//!
//! Mirrors the routing rules of the QUIC relay: peers register and get an
//! id, frames are delivered in order per destination, the recipient learns
//! whether it is the polite side, and frames for unknown peers bounce back
//! as `PeerUnavailable`. Delivery can be paused to line up glare scenarios.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::application::ports::{SignalingChannel, SignalingEvent, SignalingObserver};
use crate::domain::control::is_polite;
use crate::domain::identity::PeerId;

/// What kind of frame a peer sent through the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedKind {
    Signal,
    IceCandidate,
    EndCall,
}

/// One frame accepted by the hub, in send order.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: RoutedKind,
    pub payload: Bytes,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    peers: HashMap<PeerId, Arc<dyn SignalingObserver>>,
    paused: bool,
    held: VecDeque<(PeerId, SignalingEvent)>,
    routed: Vec<RoutedMessage>,
}

#[derive(Default)]
pub struct InMemorySignalingHub {
    state: Mutex<HubState>,
}

impl InMemorySignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh, unregistered endpoint on this hub.
    pub fn channel(self: &Arc<Self>) -> InMemorySignalingChannel {
        InMemorySignalingChannel {
            hub: Arc::clone(self),
            id: Mutex::new(None),
        }
    }

    /// Hold deliveries until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Deliver everything held, in order, and stop holding.
    pub fn resume(&self) {
        let (held, peers) = {
            let mut st = self.state.lock();
            st.paused = false;
            (std::mem::take(&mut st.held), st.peers.clone())
        };
        for (to, event) in held {
            if let Some(observer) = peers.get(&to) {
                observer.on_event(event);
            }
        }
    }

    pub fn routed(&self) -> Vec<RoutedMessage> {
        self.state.lock().routed.clone()
    }

    pub fn is_registered(&self, peer: PeerId) -> bool {
        self.state.lock().peers.contains_key(&peer)
    }

    fn register(&self, observer: Arc<dyn SignalingObserver>) -> PeerId {
        let id = {
            let mut st = self.state.lock();
            st.next_id += 1;
            let id = PeerId(st.next_id);
            st.peers.insert(id, Arc::clone(&observer));
            id
        };
        debug!(peer = %id, "Peer registered with hub");
        observer.on_event(SignalingEvent::SocketOpened);
        id
    }

    fn unregister(&self, peer: PeerId) {
        let observer = self.state.lock().peers.remove(&peer);
        if let Some(observer) = observer {
            debug!(%peer, "Peer left hub");
            observer.on_event(SignalingEvent::SocketClosed);
        }
    }

    fn route(&self, from: PeerId, to: PeerId, kind: RoutedKind, payload: Bytes) {
        let delivery = {
            let mut st = self.state.lock();
            st.routed.push(RoutedMessage {
                from,
                to,
                kind,
                payload: payload.clone(),
            });
            let (target, event) = if st.peers.contains_key(&to) {
                let event = match kind {
                    RoutedKind::Signal => SignalingEvent::Signal {
                        payload,
                        from,
                        is_polite: is_polite(to, from),
                    },
                    RoutedKind::IceCandidate => SignalingEvent::IceCandidate { payload, from },
                    RoutedKind::EndCall => SignalingEvent::EndCall { from },
                };
                (to, event)
            } else {
                debug!(%from, %to, "Destination unknown");
                (from, SignalingEvent::PeerUnavailable { peer: to })
            };
            if st.paused {
                st.held.push_back((target, event));
                None
            } else {
                st.peers.get(&target).cloned().map(|o| (o, event))
            }
        };
        if let Some((observer, event)) = delivery {
            trace!(%from, %to, ?kind, "Delivering");
            observer.on_event(event);
        }
    }
}

/// One endpoint of an [`InMemorySignalingHub`].
pub struct InMemorySignalingChannel {
    hub: Arc<InMemorySignalingHub>,
    id: Mutex<Option<PeerId>>,
}

impl InMemorySignalingChannel {
    pub fn peer_id(&self) -> Option<PeerId> {
        *self.id.lock()
    }

    fn require_id(&self) -> anyhow::Result<PeerId> {
        self.peer_id()
            .ok_or_else(|| anyhow::anyhow!("signaling channel not connected"))
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignalingChannel {
    async fn connect(&self, observer: Arc<dyn SignalingObserver>) -> anyhow::Result<PeerId> {
        anyhow::ensure!(self.peer_id().is_none(), "already connected");
        let id = self.hub.register(observer);
        *self.id.lock() = Some(id);
        Ok(id)
    }

    async fn send_signal(&self, payload: Bytes, to: PeerId) -> anyhow::Result<()> {
        let from = self.require_id()?;
        self.hub.route(from, to, RoutedKind::Signal, payload);
        Ok(())
    }

    async fn send_ice_candidate(&self, payload: Bytes, to: PeerId) -> anyhow::Result<()> {
        let from = self.require_id()?;
        self.hub.route(from, to, RoutedKind::IceCandidate, payload);
        Ok(())
    }

    async fn send_end_call(&self, to: PeerId) -> anyhow::Result<()> {
        let from = self.require_id()?;
        self.hub.route(from, to, RoutedKind::EndCall, Bytes::new());
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(id) = self.id.lock().take() {
            self.hub.unregister(id);
        }
    }
}

/// Observer that drops every event.
pub struct NullSignalingObserver;

impl SignalingObserver for NullSignalingObserver {
    fn on_event(&self, _event: SignalingEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Inbox(Mutex<Vec<SignalingEvent>>);

    impl SignalingObserver for Inbox {
        fn on_event(&self, event: SignalingEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn routes_with_politeness_and_bounces_unknown_peers() {
        let hub = InMemorySignalingHub::new();
        let (a, b) = (hub.channel(), hub.channel());
        let (inbox_a, inbox_b) = (Arc::new(Inbox::default()), Arc::new(Inbox::default()));
        let id_a = a.connect(inbox_a.clone()).await.unwrap();
        let id_b = b.connect(inbox_b.clone()).await.unwrap();
        assert!(id_b > id_a);

        a.send_signal(Bytes::from_static(b"offer"), id_b).await.unwrap();
        b.send_signal(Bytes::from_static(b"answer"), id_a).await.unwrap();
        a.send_end_call(PeerId(99)).await.unwrap();

        let to_b = inbox_b.0.lock().clone();
        assert_eq!(
            to_b[1],
            SignalingEvent::Signal {
                payload: Bytes::from_static(b"offer"),
                from: id_a,
                is_polite: true,
            }
        );
        let to_a = inbox_a.0.lock().clone();
        assert!(matches!(to_a[1], SignalingEvent::Signal { is_polite: false, .. }));
        assert_eq!(to_a[2], SignalingEvent::PeerUnavailable { peer: PeerId(99) });
    }

    #[tokio::test]
    async fn paused_hub_holds_frames_in_order() {
        let hub = InMemorySignalingHub::new();
        let (a, b) = (hub.channel(), hub.channel());
        let inbox = Arc::new(Inbox::default());
        a.connect(Arc::new(NullSignalingObserver)).await.unwrap();
        let id_b = b.connect(inbox.clone()).await.unwrap();

        hub.pause();
        a.send_signal(Bytes::from_static(b"1"), id_b).await.unwrap();
        a.send_ice_candidate(Bytes::from_static(b"2"), id_b).await.unwrap();
        assert_eq!(inbox.0.lock().len(), 1);

        hub.resume();
        let events = inbox.0.lock().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], SignalingEvent::IceCandidate { .. }));
        assert_eq!(hub.routed().len(), 2);
    }
}
