//! Quinn-based QUIC signaling relay.
//!
//! Accepts client connections, assigns peer ids, and routes signal,
//! candidate and end-call frames between registered peers. The relay never
//! looks inside payloads; it only stamps the origin and tells the recipient
//! whether it is the polite side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::domain::control::ControlMsg;
use crate::domain::identity::PeerId;

use super::codec::CborControlCodec;

// ---------------------------------------------------------------------------
// Per-peer connection state on the server
// ---------------------------------------------------------------------------

struct PeerConn {
    peer_id: PeerId,
    connection: Connection,
    control_send: Mutex<SendStream>,
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub struct SignalingRelay {
    endpoint: Endpoint,
    peers: RwLock<HashMap<PeerId, Arc<PeerConn>>>,
    codec: CborControlCodec,
    next_peer_id: AtomicU64,
}

impl SignalingRelay {
    /// Create and bind the relay.
    pub fn new(bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let server_config = Self::generate_self_signed_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        info!(addr = %endpoint.local_addr()?, "Signaling relay listening");

        Ok(Self {
            endpoint,
            peers: RwLock::new(HashMap::new()),
            codec: CborControlCodec,
            next_peer_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Run the accept loop.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        while let Some(incoming) = self.endpoint.accept().await {
            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        if let Err(e) = relay.handle_connection(conn).await {
                            warn!("Connection handler error: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            });
        }
        Ok(())
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"relay shutting down");
    }

    // -----------------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------------

    async fn handle_connection(&self, connection: Connection) -> anyhow::Result<()> {
        let (mut control_send, mut control_recv) = connection.accept_bi().await?;

        match self.codec.read_msg(&mut control_recv).await? {
            ControlMsg::Hello { client_version } => {
                debug!(%client_version, remote = %connection.remote_address(), "Hello");
            }
            other => anyhow::bail!("Expected Hello, got {:?}", other),
        }

        let peer_id = PeerId(self.next_peer_id.fetch_add(1, Ordering::Relaxed));
        self.codec
            .write_msg(&mut control_send, &ControlMsg::Welcome { peer_id })
            .await?;

        let peer = Arc::new(PeerConn {
            peer_id,
            connection,
            control_send: Mutex::new(control_send),
        });
        self.peers.write().await.insert(peer_id, Arc::clone(&peer));
        info!(%peer_id, "Peer registered");

        let result = self.control_loop(&peer, &mut control_recv).await;

        self.peers.write().await.remove(&peer_id);
        info!(%peer_id, "Peer left");
        result
    }

    async fn control_loop(
        &self,
        peer: &Arc<PeerConn>,
        control_recv: &mut RecvStream,
    ) -> anyhow::Result<()> {
        loop {
            let msg = match self.codec.read_msg(control_recv).await {
                Ok(m) => m,
                Err(_) => break, // stream closed
            };

            let Some(destination) = msg.destination() else {
                debug!(peer_id = %peer.peer_id, ?msg, "Ignoring control message");
                continue;
            };
            self.route(peer, destination, msg).await;
        }
        peer.connection.close(0u32.into(), b"");
        Ok(())
    }

    async fn route(&self, from: &PeerConn, to: PeerId, msg: ControlMsg) {
        let target = self.peers.read().await.get(&to).cloned();
        match target {
            Some(target) => {
                let routed = msg.routed_from(from.peer_id);
                if let Err(e) = self.send_control_msg(&target, &routed).await {
                    warn!(%to, "Failed to forward control message: {e}");
                }
            }
            None => {
                debug!(from = %from.peer_id, %to, "Destination unavailable");
                let bounce = ControlMsg::PeerUnavailable { peer_id: to };
                if let Err(e) = self.send_control_msg(from, &bounce).await {
                    warn!(peer_id = %from.peer_id, "Failed to report unavailable peer: {e}");
                }
            }
        }
    }

    async fn send_control_msg(&self, peer: &PeerConn, msg: &ControlMsg) -> anyhow::Result<()> {
        let mut send = peer.control_send.lock().await;
        self.codec.write_msg(&mut send, msg).await
    }

    // -----------------------------------------------------------------------
    // Self-signed TLS config (dev only)
    // -----------------------------------------------------------------------

    fn generate_self_signed_config() -> anyhow::Result<ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
        let cert_der = cert.cert.der().to_vec();
        let key_der =
            rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::pki_types::CertificateDer::from(cert_der)],
                rustls::pki_types::PrivateKeyDer::Pkcs8(key_der),
            )?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(quinn::IdleTimeout::try_from(
            std::time::Duration::from_secs(30),
        )?));
        transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(10)));

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_config.transport_config(Arc::new(transport_config));

        Ok(server_config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::adapters::quic::client::QuicSignalingChannel;
    use crate::application::ports::{SignalingChannel, SignalingEvent, SignalingObserver};

    struct Forward(mpsc::UnboundedSender<SignalingEvent>);

    impl SignalingObserver for Forward {
        fn on_event(&self, event: SignalingEvent) {
            let _ = self.0.send(event);
        }
    }

    async fn next_routed(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("observer dropped");
            if event != SignalingEvent::SocketOpened {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn relays_between_clients() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()).unwrap());
        let addr = relay.local_addr().unwrap();
        tokio::spawn(Arc::clone(&relay).run());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = QuicSignalingChannel::new(addr, "localhost");
        let b = QuicSignalingChannel::new(addr, "localhost");
        let id_a = a.connect(Arc::new(Forward(tx_a))).await.unwrap();
        let id_b = b.connect(Arc::new(Forward(tx_b))).await.unwrap();

        a.send_signal(Bytes::from_static(b"offer"), id_b).await.unwrap();
        assert_eq!(
            next_routed(&mut rx_b).await,
            SignalingEvent::Signal {
                payload: Bytes::from_static(b"offer"),
                from: id_a,
                is_polite: true,
            }
        );

        b.send_end_call(id_a).await.unwrap();
        assert_eq!(
            next_routed(&mut rx_a).await,
            SignalingEvent::EndCall { from: id_b }
        );

        a.send_ice_candidate(Bytes::from_static(b"c"), PeerId(999))
            .await
            .unwrap();
        assert_eq!(
            next_routed(&mut rx_a).await,
            SignalingEvent::PeerUnavailable { peer: PeerId(999) }
        );

        a.disconnect();
        b.disconnect();
        relay.close();
    }
}
