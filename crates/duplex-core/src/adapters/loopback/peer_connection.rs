//! In-memory [`PeerConnection`] adapter.
//!
//! Simulates the parts of a native WebRTC stack the negotiation core relies
//! on: the JSEP signaling state machine (including rollback), ICE gathering
//! with one host candidate per gathering round, connectivity once both
//! descriptions are committed, remote track / data channel discovery from
//! the remote SDP, sender encodings and outbound packet counters.
//!
//! No media flows. Used by tests, by the CLI, and wherever a real stack is
//! unavailable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use crate::application::ports::{
    PeerConnection, PeerConnectionEvent, PeerConnectionFactory, PeerConnectionObserver,
};
use crate::domain::media::{EncodingParameters, MediaKind, TransportStats};
use crate::domain::peer::{
    DataChannelConfig, IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints,
    PeerConnectionState, RtcConfiguration, SdpType, SessionDescription, SignalingState,
};

/// Packets added to the simulated counters per stats query.
const PACKETS_PER_SAMPLE: u64 = 100;

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates [`LoopbackPeerConnection`]s and remembers them for inspection.
pub struct LoopbackPeerConnectionFactory {
    auto_connect: bool,
    created: Mutex<Vec<Arc<LoopbackPeerConnection>>>,
}

impl LoopbackPeerConnectionFactory {
    /// `auto_connect`: report connectivity as soon as an offer/answer
    /// exchange completes.
    pub fn new(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn last_created(&self) -> Option<Arc<LoopbackPeerConnection>> {
        self.created.lock().last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl Default for LoopbackPeerConnectionFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PeerConnectionFactory for LoopbackPeerConnectionFactory {
    fn create(
        &self,
        config: &RtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        trace!(servers = config.ice_servers.len(), "Creating loopback peer connection");
        let pc = Arc::new(LoopbackPeerConnection::new(observer, self.auto_connect));
        self.created.lock().push(Arc::clone(&pc));
        Ok(pc)
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

struct PcState {
    signaling: SignalingState,
    gathering: IceGatheringState,
    ice: IceConnectionState,
    connection: PeerConnectionState,

    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,

    session_id: u64,
    sdp_version: u64,
    ice_ufrag: String,
    /// Gathering must restart with the next local description.
    regather: bool,
    candidate_seq: u32,

    tracks: HashMap<MediaKind, String>,
    params: HashMap<MediaKind, EncodingParameters>,
    remote_tracks: HashMap<MediaKind, String>,
    data_channels: Vec<String>,
    remote_data_channels: HashSet<String>,
    remote_candidates: Vec<IceCandidate>,

    scripted_stats: HashMap<MediaKind, VecDeque<TransportStats>>,
    counters: HashMap<MediaKind, TransportStats>,
    simulated_loss: f64,

    closed: bool,
}

pub struct LoopbackPeerConnection {
    observer: Arc<dyn PeerConnectionObserver>,
    auto_connect: bool,
    state: Mutex<PcState>,
}

struct NullObserver;

impl PeerConnectionObserver for NullObserver {
    fn on_event(&self, _event: PeerConnectionEvent) {}
}

impl LoopbackPeerConnection {
    pub fn new(observer: Arc<dyn PeerConnectionObserver>, auto_connect: bool) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            observer,
            auto_connect,
            state: Mutex::new(PcState {
                signaling: SignalingState::Stable,
                gathering: IceGatheringState::New,
                ice: IceConnectionState::New,
                connection: PeerConnectionState::New,
                current_local: None,
                pending_local: None,
                current_remote: None,
                pending_remote: None,
                session_id: rng.gen(),
                sdp_version: 0,
                ice_ufrag: random_ufrag(&mut rng),
                regather: true,
                candidate_seq: 0,
                tracks: HashMap::new(),
                params: HashMap::new(),
                remote_tracks: HashMap::new(),
                data_channels: Vec::new(),
                remote_data_channels: HashSet::new(),
                remote_candidates: Vec::new(),
                scripted_stats: HashMap::new(),
                counters: HashMap::new(),
                simulated_loss: 0.0,
                closed: false,
            }),
        }
    }

    /// A connection whose callbacks go nowhere.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(NullObserver), false))
    }

    // -- Test / simulation controls --

    /// Queue counters returned by the next `transport_stats(kind)` calls.
    pub fn push_stats(&self, kind: MediaKind, stats: TransportStats) {
        self.state
            .lock()
            .scripted_stats
            .entry(kind)
            .or_default()
            .push_back(stats);
    }

    /// Fraction of simulated packets reported lost.
    pub fn set_simulated_loss(&self, loss: f64) {
        self.state.lock().simulated_loss = loss.clamp(0.0, 1.0);
    }

    /// Force an ICE connection state, as a network change would.
    pub fn simulate_ice_connection_state(&self, ice: IceConnectionState) {
        let events = {
            let mut st = self.state.lock();
            st.ice = ice;
            let mut events = vec![PeerConnectionEvent::IceConnectionStateChanged(ice)];
            let connection = match ice {
                IceConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
                IceConnectionState::Failed => Some(PeerConnectionState::Failed),
                _ => None,
            };
            if let Some(connection) = connection {
                st.connection = connection;
                events.push(PeerConnectionEvent::ConnectionStateChanged(connection));
            }
            events
        };
        self.emit(events);
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn local_tracks(&self) -> Vec<MediaKind> {
        let st = self.state.lock();
        MediaKind::ALL
            .into_iter()
            .filter(|k| st.tracks.contains_key(k))
            .collect()
    }

    pub fn data_channels(&self) -> Vec<String> {
        self.state.lock().data_channels.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn emit(&self, events: Vec<PeerConnectionEvent>) {
        for event in events {
            self.observer.on_event(event);
        }
    }

    // -- SDP helpers --

    fn build_sdp(
        st: &mut PcState,
        constraints: MediaConstraints,
        remote_offer: Option<&str>,
    ) -> String {
        st.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\n",
            st.session_id, st.sdp_version, st.ice_ufrag
        );
        for kind in MediaKind::ALL {
            let wanted = match kind {
                MediaKind::Audio => constraints.offer_to_receive_audio,
                MediaKind::Video => constraints.offer_to_receive_video,
            };
            let remote_has = remote_offer.is_some_and(|r| r.contains(&format!("m={kind} ")));
            let local = st.tracks.get(&kind);
            if local.is_none() && !wanted && !remote_has {
                continue;
            }
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\n"));
            match local {
                Some(track_id) => sdp.push_str(&format!("a=msid:- {track_id}\r\na=sendrecv\r\n")),
                None => sdp.push_str("a=recvonly\r\n"),
            }
        }
        let remote_channels = remote_offer.map(data_channel_labels).unwrap_or_default();
        if !st.data_channels.is_empty() || !remote_channels.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
            for label in &st.data_channels {
                sdp.push_str(&format!("a=x-datachannel:{label}\r\n"));
            }
        }
        sdp
    }

    /// Diff remote tracks / channels against a newly applied remote SDP.
    fn discover_remote_media(st: &mut PcState, sdp: &str) -> Vec<PeerConnectionEvent> {
        let mut events = Vec::new();
        let announced = remote_tracks(sdp);
        for kind in MediaKind::ALL {
            match (st.remote_tracks.get(&kind).cloned(), announced.get(&kind)) {
                (None, Some(track_id)) => {
                    st.remote_tracks.insert(kind, track_id.clone());
                    events.push(PeerConnectionEvent::RemoteTrackAdded {
                        kind,
                        track_id: track_id.clone(),
                    });
                }
                (Some(track_id), None) => {
                    st.remote_tracks.remove(&kind);
                    events.push(PeerConnectionEvent::RemoteTrackRemoved { kind, track_id });
                }
                _ => {}
            }
        }
        for label in data_channel_labels(sdp) {
            if st.remote_data_channels.insert(label.clone()) {
                events.push(PeerConnectionEvent::DataChannelOpened { label });
            }
        }
        events
    }

    /// Start a gathering round if one is due; returns the events to emit.
    fn maybe_gather(st: &mut PcState) -> Vec<PeerConnectionEvent> {
        if !st.regather {
            return Vec::new();
        }
        st.regather = false;
        st.gathering = IceGatheringState::Gathering;
        st.candidate_seq += 1;
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                st.candidate_seq,
                50_000 + st.candidate_seq,
                st.ice_ufrag
            ),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        };
        vec![
            PeerConnectionEvent::IceGatheringStateChanged(IceGatheringState::Gathering),
            PeerConnectionEvent::IceCandidateGenerated(candidate),
        ]
    }

    /// Report connectivity once both sides' descriptions are committed.
    fn maybe_connect(&self, st: &mut PcState) -> Vec<PeerConnectionEvent> {
        let committed = st.signaling == SignalingState::Stable
            && st.current_local.is_some()
            && st.current_remote.is_some();
        let connected = matches!(
            st.ice,
            IceConnectionState::Connected | IceConnectionState::Completed
        );
        if !self.auto_connect || !committed || connected {
            return Vec::new();
        }
        st.ice = IceConnectionState::Connected;
        let mut events = vec![
            PeerConnectionEvent::IceConnectionStateChanged(IceConnectionState::Checking),
            PeerConnectionEvent::IceConnectionStateChanged(IceConnectionState::Connected),
        ];
        if st.connection != PeerConnectionState::Connected {
            st.connection = PeerConnectionState::Connected;
            events.push(PeerConnectionEvent::ConnectionStateChanged(
                PeerConnectionState::Connecting,
            ));
            events.push(PeerConnectionEvent::ConnectionStateChanged(
                PeerConnectionState::Connected,
            ));
        }
        events
    }

    fn set_signaling(st: &mut PcState, to: SignalingState, events: &mut Vec<PeerConnectionEvent>) {
        if st.signaling != to {
            st.signaling = to;
            events.push(PeerConnectionEvent::SignalingStateChanged(to));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<SessionDescription> {
        let mut st = self.state.lock();
        anyhow::ensure!(!st.closed, "peer connection closed");
        anyhow::ensure!(
            matches!(st.signaling, SignalingState::Stable | SignalingState::HaveLocalOffer),
            "cannot create offer in {:?}",
            st.signaling
        );
        if constraints.ice_restart {
            st.ice_ufrag = random_ufrag(&mut rand::thread_rng());
            st.regather = true;
        }
        let sdp = Self::build_sdp(&mut st, constraints, None);
        Ok(SessionDescription::new(SdpType::Offer, sdp))
    }

    async fn create_answer(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<SessionDescription> {
        let mut st = self.state.lock();
        anyhow::ensure!(!st.closed, "peer connection closed");
        let offer = match (&st.signaling, &st.pending_remote) {
            (SignalingState::HaveRemoteOffer, Some(offer)) => offer.sdp.clone(),
            _ => anyhow::bail!("cannot create answer in {:?}", st.signaling),
        };
        let sdp = Self::build_sdp(&mut st, constraints, Some(&offer));
        Ok(SessionDescription::new(SdpType::Answer, sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let events = {
            let mut st = self.state.lock();
            anyhow::ensure!(!st.closed, "peer connection closed");
            let mut events = Vec::new();
            match (desc.sdp_type, st.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    st.pending_local = Some(desc);
                    Self::set_signaling(&mut st, SignalingState::HaveLocalOffer, &mut events);
                }
                (
                    SdpType::Answer,
                    SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer,
                ) => {
                    st.current_local = Some(desc);
                    st.pending_local = None;
                    if let Some(remote) = st.pending_remote.take() {
                        st.current_remote = Some(remote);
                    }
                    Self::set_signaling(&mut st, SignalingState::Stable, &mut events);
                }
                (SdpType::ProvisionalAnswer, SignalingState::HaveRemoteOffer) => {
                    st.pending_local = Some(desc);
                    Self::set_signaling(&mut st, SignalingState::HaveLocalPrAnswer, &mut events);
                }
                (
                    SdpType::Rollback,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer,
                ) => {
                    st.pending_local = None;
                    st.pending_remote = None;
                    Self::set_signaling(&mut st, SignalingState::Stable, &mut events);
                }
                (sdp_type, signaling) => {
                    anyhow::bail!("cannot set local {sdp_type:?} in {signaling:?}")
                }
            }
            events.extend(Self::maybe_gather(&mut st));
            events.extend(self.maybe_connect(&mut st));
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let events = {
            let mut st = self.state.lock();
            anyhow::ensure!(!st.closed, "peer connection closed");
            let mut events = Vec::new();
            match (desc.sdp_type, st.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    let previous = st
                        .current_remote
                        .as_ref()
                        .and_then(|d| remote_ufrag(&d.sdp));
                    if remote_ufrag(&desc.sdp) != previous {
                        // Remote restarted ICE (or first offer): gather again.
                        st.regather = true;
                    }
                    events.extend(Self::discover_remote_media(&mut st, &desc.sdp));
                    st.pending_remote = Some(desc);
                    Self::set_signaling(&mut st, SignalingState::HaveRemoteOffer, &mut events);
                }
                (
                    SdpType::Answer,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
                ) => {
                    events.extend(Self::discover_remote_media(&mut st, &desc.sdp));
                    st.current_remote = Some(desc);
                    st.pending_remote = None;
                    if let Some(local) = st.pending_local.take() {
                        st.current_local = Some(local);
                    }
                    Self::set_signaling(&mut st, SignalingState::Stable, &mut events);
                }
                (SdpType::ProvisionalAnswer, SignalingState::HaveLocalOffer) => {
                    st.pending_remote = Some(desc);
                    Self::set_signaling(&mut st, SignalingState::HaveRemotePrAnswer, &mut events);
                }
                (SdpType::Rollback, SignalingState::HaveRemoteOffer) => {
                    st.pending_remote = None;
                    Self::set_signaling(&mut st, SignalingState::Stable, &mut events);
                }
                (sdp_type, signaling) => {
                    anyhow::bail!("cannot set remote {sdp_type:?} in {signaling:?}")
                }
            }
            events.extend(self.maybe_connect(&mut st));
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        anyhow::ensure!(!st.closed, "peer connection closed");
        anyhow::ensure!(
            st.current_remote.is_some() || st.pending_remote.is_some(),
            "no remote description"
        );
        st.remote_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&self, kind: MediaKind, track_id: &str) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        anyhow::ensure!(!st.closed, "peer connection closed");
        anyhow::ensure!(!st.tracks.contains_key(&kind), "{kind} track already added");
        st.tracks.insert(kind, track_id.to_string());
        st.params.insert(kind, EncodingParameters::default());
        st.counters.insert(kind, TransportStats::default());
        Ok(())
    }

    fn remove_track(&self, kind: MediaKind) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        anyhow::ensure!(st.tracks.remove(&kind).is_some(), "no {kind} track");
        st.params.remove(&kind);
        st.counters.remove(&kind);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().gathering
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let st = self.state.lock();
        st.pending_local.clone().or_else(|| st.current_local.clone())
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        let st = self.state.lock();
        st.pending_remote.clone().or_else(|| st.current_remote.clone())
    }

    fn sender_parameters(&self, kind: MediaKind) -> Option<EncodingParameters> {
        self.state.lock().params.get(&kind).copied()
    }

    fn set_sender_parameters(
        &self,
        kind: MediaKind,
        params: EncodingParameters,
    ) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        let slot = st
            .params
            .get_mut(&kind)
            .ok_or_else(|| anyhow::anyhow!("no {kind} sender"))?;
        *slot = params;
        Ok(())
    }

    async fn transport_stats(&self, kind: MediaKind) -> Option<TransportStats> {
        let mut st = self.state.lock();
        if st.closed {
            return None;
        }
        if let Some(stats) = st.scripted_stats.get_mut(&kind).and_then(|q| q.pop_front()) {
            return Some(stats);
        }
        let loss = st.simulated_loss;
        let counters = st.counters.get_mut(&kind)?;
        counters.packets_sent += PACKETS_PER_SAMPLE;
        counters.packets_lost += (PACKETS_PER_SAMPLE as f64 * loss).round() as u64;
        Some(*counters)
    }

    fn create_data_channel(&self, label: &str, config: &DataChannelConfig) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        anyhow::ensure!(!st.closed, "peer connection closed");
        anyhow::ensure!(
            config.max_packet_life_time.is_none() || config.max_retransmits.is_none(),
            "max_packet_life_time and max_retransmits are mutually exclusive"
        );
        anyhow::ensure!(
            !st.data_channels.iter().any(|l| l == label),
            "data channel {label} already exists"
        );
        st.data_channels.push(label.to_string());
        Ok(())
    }

    fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.signaling = SignalingState::Closed;
        st.ice = IceConnectionState::Closed;
        st.connection = PeerConnectionState::Closed;
    }
}

fn random_ufrag(rng: &mut impl Rng) -> String {
    (0..8)
        .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
        .collect()
}

fn remote_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines().find_map(|l| l.strip_prefix("a=ice-ufrag:"))
}

/// Sending media sections of an SDP, keyed by kind.
fn remote_tracks(sdp: &str) -> HashMap<MediaKind, String> {
    let mut tracks = HashMap::new();
    let mut section: Option<MediaKind> = None;
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            section = MediaKind::ALL
                .into_iter()
                .find(|k| rest.starts_with(&format!("{k} ")));
        } else if let (Some(kind), Some(msid)) = (section, line.strip_prefix("a=msid:- ")) {
            tracks.insert(kind, msid.to_string());
        }
    }
    tracks
}

fn data_channel_labels(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|l| l.strip_prefix("a=x-datachannel:"))
        .map(str::to_string)
        .collect()
}
