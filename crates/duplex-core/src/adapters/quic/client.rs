//! Quinn-based QUIC [`SignalingChannel`] adapter.
//!
//! Wraps a single QUIC connection to the [`SignalingRelay`](super::server::SignalingRelay)
//! with one bidirectional control stream. A reader task turns inbound frames
//! into [`SignalingEvent`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::ports::{SignalingChannel, SignalingEvent, SignalingObserver};
use crate::domain::control::ControlMsg;
use crate::domain::identity::PeerId;

use super::codec::CborControlCodec;

const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// QuicSignalingChannel
// ---------------------------------------------------------------------------

struct Live {
    connection: Connection,
    control_send: Arc<Mutex<SendStream>>,
    reader: JoinHandle<()>,
}

/// Client-side [`SignalingChannel`] backed by Quinn.
pub struct QuicSignalingChannel {
    server_addr: SocketAddr,
    server_name: String,
    codec: CborControlCodec,
    live: parking_lot::Mutex<Option<Live>>,
}

impl QuicSignalingChannel {
    pub fn new(server_addr: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            server_addr,
            server_name: server_name.into(),
            codec: CborControlCodec,
            live: parking_lot::Mutex::new(None),
        }
    }

    fn endpoint() -> anyhow::Result<Endpoint> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;

        // The relay uses a self-signed certificate (dev only).
        let crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
        ));
        endpoint.set_default_client_config(client_config);
        Ok(endpoint)
    }

    async fn send(&self, msg: ControlMsg) -> anyhow::Result<()> {
        let send = self
            .live
            .lock()
            .as_ref()
            .map(|live| Arc::clone(&live.control_send))
            .ok_or_else(|| anyhow::anyhow!("signaling channel not connected"))?;
        let mut send = send.lock().await;
        self.codec.write_msg(&mut send, &msg).await
    }
}

#[async_trait]
impl SignalingChannel for QuicSignalingChannel {
    async fn connect(&self, observer: Arc<dyn SignalingObserver>) -> anyhow::Result<PeerId> {
        anyhow::ensure!(self.live.lock().is_none(), "already connected");

        info!(server_addr = %self.server_addr, "Connecting to signaling relay");
        let endpoint = Self::endpoint()?;
        let connection = endpoint.connect(self.server_addr, &self.server_name)?.await?;
        let (mut send, mut recv) = connection.open_bi().await?;

        self.codec
            .write_msg(
                &mut send,
                &ControlMsg::Hello {
                    client_version: CLIENT_VERSION.into(),
                },
            )
            .await?;
        let peer_id = match self.codec.read_msg(&mut recv).await? {
            ControlMsg::Welcome { peer_id } => peer_id,
            other => anyhow::bail!("Expected Welcome, got {:?}", other),
        };
        info!(%peer_id, "Registered with relay");

        observer.on_event(SignalingEvent::SocketOpened);
        let reader = tokio::spawn(read_loop(self.codec, recv, observer));
        *self.live.lock() = Some(Live {
            connection,
            control_send: Arc::new(Mutex::new(send)),
            reader,
        });
        Ok(peer_id)
    }

    async fn send_signal(&self, payload: Bytes, to: PeerId) -> anyhow::Result<()> {
        self.send(ControlMsg::Signal {
            peer_id: to,
            payload: payload.to_vec(),
            is_polite: false,
        })
        .await
    }

    async fn send_ice_candidate(&self, payload: Bytes, to: PeerId) -> anyhow::Result<()> {
        self.send(ControlMsg::IceCandidate {
            peer_id: to,
            payload: payload.to_vec(),
        })
        .await
    }

    async fn send_end_call(&self, to: PeerId) -> anyhow::Result<()> {
        self.send(ControlMsg::EndCall { peer_id: to }).await
    }

    fn disconnect(&self) {
        if let Some(live) = self.live.lock().take() {
            live.reader.abort();
            live.connection.close(0u32.into(), b"bye");
            info!("Disconnected from relay");
        }
    }
}

async fn read_loop(
    codec: CborControlCodec,
    mut recv: RecvStream,
    observer: Arc<dyn SignalingObserver>,
) {
    loop {
        let msg = match codec.read_msg(&mut recv).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Control stream ended: {e}");
                break;
            }
        };
        let event = match msg {
            ControlMsg::Signal {
                peer_id,
                payload,
                is_polite,
            } => SignalingEvent::Signal {
                payload: Bytes::from(payload),
                from: peer_id,
                is_polite,
            },
            ControlMsg::IceCandidate { peer_id, payload } => SignalingEvent::IceCandidate {
                payload: Bytes::from(payload),
                from: peer_id,
            },
            ControlMsg::EndCall { peer_id } => SignalingEvent::EndCall { from: peer_id },
            ControlMsg::PeerUnavailable { peer_id } => {
                SignalingEvent::PeerUnavailable { peer: peer_id }
            }
            other => {
                warn!(?other, "Unexpected control message");
                continue;
            }
        };
        observer.on_event(event);
    }
    observer.on_event(SignalingEvent::SocketClosed);
}

// ---------------------------------------------------------------------------
// Dev-only certificate verifier (skip verification)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
