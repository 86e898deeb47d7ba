//! Negotiation engine: perfect negotiation over one peer connection.
//!
//! Owned by the session actor (see [`super::session`]); every method takes
//! `&mut self` and runs to completion before the next queued event is looked
//! at, so the role flags below never race with callbacks or timers.
//!
//! Responsibilities:
//! 1. Offer / answer exchange, including glare between two offering peers:
//!    the polite side rolls back and answers, the impolite side ignores the
//!    colliding offer.
//! 2. Renegotiation batching through `start_configuration` /
//!    `commit_configuration`.
//! 3. Buffering remote ICE candidates until the connection can take them.
//! 4. Driving the [`CallStateMachine`], the [`BitrateAdjustor`] and the
//!    connection watchdog from connection callbacks.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::call_state::{CallState, CallStateMachine};
use crate::domain::config::SessionConfig;
use crate::domain::error::CallError;
use crate::domain::identity::{PeerId, TrackOrigin};
use crate::domain::media::MediaKind;
use crate::domain::peer::{
    DataChannelConfig, IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints,
    PeerConnectionState, SdpType, SessionDescription, SignalingState,
};
use crate::domain::signal::SignalMessage;

use super::bitrate_adapt::BitrateAdjustor;
use super::candidate_cache::IceCandidateCache;
use super::ports::{
    CallEvents, PathStatus, PeerConnection, PeerConnectionEvent, PeerConnectionFactory,
    SignalCodec, SignalingChannel, SignalingEvent,
};
use super::session::{CallCommand, QueueObserver, SessionEvent, SessionQueue};

type CallResult<T> = Result<T, CallError>;

/// Collaborators injected into a [`NegotiationEngine`].
#[derive(Clone)]
pub struct EngineDeps {
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub codec: Arc<dyn SignalCodec>,
}

pub struct NegotiationEngine {
    config: SessionConfig,
    deps: EngineDeps,
    state: Arc<CallStateMachine>,
    events: Option<Weak<dyn CallEvents>>,
    queue: SessionQueue,

    local_peer: Option<PeerId>,
    pc: Option<Arc<dyn PeerConnection>>,
    remote_peer: Option<PeerId>,
    received_offer: Option<SessionDescription>,

    // -- Role flags --
    is_polite: bool,
    /// Politeness is taken from the first inbound signal of a call.
    politeness_fixed: bool,
    is_preparing_offer: bool,
    is_configuring: bool,
    is_commit_configuration_postponed: bool,
    configuration_changed: bool,
    is_processing_candidates: bool,

    candidates: IceCandidateCache,
    adjustor: BitrateAdjustor,
    video_enabled: bool,
    path: PathStatus,

    timeout: Option<JoinHandle<()>>,
    timeout_attempt: u64,
}

impl NegotiationEngine {
    pub fn new(
        config: SessionConfig,
        deps: EngineDeps,
        state: Arc<CallStateMachine>,
        events: Weak<dyn CallEvents>,
        queue: SessionQueue,
    ) -> Self {
        let adjustor = BitrateAdjustor::new(&config, queue.clone());
        Self {
            config,
            deps,
            state,
            events: Some(events),
            queue,
            local_peer: None,
            pc: None,
            remote_peer: None,
            received_offer: None,
            is_polite: false,
            politeness_fixed: false,
            is_preparing_offer: false,
            is_configuring: false,
            is_commit_configuration_postponed: false,
            configuration_changed: false,
            is_processing_candidates: false,
            candidates: IceCandidateCache::new(),
            adjustor,
            video_enabled: false,
            path: PathStatus::Satisfied,
            timeout: None,
            timeout_attempt: 0,
        }
    }

    // -- Inspection --

    pub fn call_state(&self) -> CallState {
        self.state.state()
    }

    pub fn is_polite(&self) -> bool {
        self.is_polite
    }

    pub fn remote_peer(&self) -> Option<PeerId> {
        self.remote_peer
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn peer_connection(&self) -> Option<&Arc<dyn PeerConnection>> {
        self.pc.as_ref()
    }

    fn delegate(&self) -> Option<Arc<dyn CallEvents>> {
        self.events.as_ref().and_then(Weak::upgrade)
    }

    fn require_pc(&self) -> CallResult<Arc<dyn PeerConnection>> {
        self.pc
            .clone()
            .ok_or_else(|| CallError::Precondition("no active peer connection".into()))
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(cmd) => self.handle_command(cmd).await,
            SessionEvent::Signaling(ev) => self.handle_signaling(ev).await,
            SessionEvent::PeerConnection(ev) => self.handle_peer_connection(ev).await,
            SessionEvent::NetworkPath(status) => self.handle_path(status).await,
            SessionEvent::BitrateTick(which) => {
                if let Some(pc) = self.pc.clone() {
                    self.adjustor.on_tick(which, pc.as_ref(), Instant::now()).await;
                }
            }
            SessionEvent::ConnectionTimeout { attempt } => self.handle_timeout(attempt).await,
        }
    }

    async fn handle_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            CallCommand::StartCall { to, video, reply } => {
                let _ = reply.send(self.start_call(to, video).await);
            }
            CallCommand::AnswerCall { video, reply } => {
                let _ = reply.send(self.answer_call(video).await);
            }
            CallCommand::EndCall { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            CallCommand::SetVideoEnabled { enabled, reply } => {
                let _ = reply.send(self.set_video_enabled(enabled).await);
            }
            CallCommand::OpenDataChannel {
                label,
                config,
                reply,
            } => {
                let _ = reply.send(self.open_data_channel(&label, &config).await);
            }
            CallCommand::RestartIce { reply } => {
                let _ = reply.send(self.restart_ice().await);
            }
            CallCommand::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // User intents
    // -----------------------------------------------------------------------

    pub async fn connect(&mut self) -> CallResult<PeerId> {
        if let Some(id) = self.local_peer {
            return Ok(id);
        }
        let observer = Arc::new(QueueObserver::new(self.queue.clone()));
        let id = self
            .deps
            .signaling
            .connect(observer)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;
        info!(peer = %id, "Registered with signaling");
        self.local_peer = Some(id);
        Ok(id)
    }

    pub async fn start_call(&mut self, to: PeerId, video: bool) -> CallResult<()> {
        let local = self
            .local_peer
            .ok_or_else(|| CallError::Precondition("signaling not connected".into()))?;
        if to == local {
            return Err(CallError::Precondition("cannot call ourselves".into()));
        }
        if self.call_state() != CallState::Idle {
            return Err(CallError::Precondition(format!(
                "call already in progress ({})",
                self.call_state()
            )));
        }
        self.state.change_state(CallState::SendingRequest)?;
        info!(peer = %to, video, "Starting call");
        self.remote_peer = Some(to);

        if let Err(e) = self.setup_peer_connection(video).await {
            let peer = self.teardown();
            self.notify_ended(peer, Some(&e)).await;
            return Err(e);
        }

        self.start_configuration();
        self.configuration_changed = true;
        self.commit_configuration().await
    }

    pub async fn answer_call(&mut self, video: bool) -> CallResult<()> {
        if self.call_state() != CallState::ReceivingRequest {
            return Err(CallError::Precondition(format!(
                "no incoming call to answer in {}",
                self.call_state()
            )));
        }
        let offer = self
            .received_offer
            .take()
            .ok_or_else(|| CallError::Precondition("incoming call has no offer".into()))?;
        info!(peer = ?self.remote_peer, video, "Answering call");

        if let Err(e) = self.setup_peer_connection(video).await {
            warn!(peer = ?self.remote_peer, "Cannot answer: {e}");
            self.send_end_call().await;
            let peer = self.teardown();
            self.notify_ended(peer, Some(&e)).await;
            return Err(e);
        }
        self.enter_connecting()?;
        self.answer_offer(offer).await
    }

    /// Hang up. Ending while idle is a no-op.
    pub async fn end_call(&mut self) -> CallResult<()> {
        if self.call_state() == CallState::Idle {
            debug!("End call while idle; ignoring");
            return Ok(());
        }
        self.send_end_call().await;
        let peer = self.teardown();
        self.notify_ended(peer, None).await;
        Ok(())
    }

    pub async fn set_video_enabled(&mut self, enabled: bool) -> CallResult<()> {
        let pc = self.require_pc()?;
        if self.video_enabled == enabled {
            return Ok(());
        }
        self.start_configuration();
        let changed = if enabled {
            pc.add_track(MediaKind::Video, MediaKind::Video.track_id())
        } else {
            pc.remove_track(MediaKind::Video)
        };
        if let Err(e) = changed {
            self.is_configuring = false;
            return Err(CallError::Other(e));
        }
        self.video_enabled = enabled;
        self.configuration_changed = true;

        if enabled {
            if self.call_state() == CallState::Running {
                self.adjustor.start(MediaKind::Video, pc.as_ref());
            }
            self.notify_track(TrackOrigin::Local, MediaKind::Video, true).await;
        } else {
            self.adjustor.stop(MediaKind::Video);
            self.notify_track(TrackOrigin::Local, MediaKind::Video, false).await;
        }
        self.commit_configuration().await
    }

    pub async fn open_data_channel(
        &mut self,
        label: &str,
        config: &DataChannelConfig,
    ) -> CallResult<()> {
        let pc = self.require_pc()?;
        self.start_configuration();
        if let Err(e) = pc.create_data_channel(label, config) {
            self.is_configuring = false;
            return Err(CallError::Other(e));
        }
        info!(label, "Data channel created");
        self.configuration_changed = true;
        self.commit_configuration().await
    }

    /// Send an ICE-restart offer on the current connection.
    pub async fn restart_ice(&mut self) -> CallResult<()> {
        let pc = self.require_pc()?;
        if !matches!(self.call_state(), CallState::Running | CallState::Connecting) {
            return Err(CallError::Precondition(format!(
                "ICE restart in {}",
                self.call_state()
            )));
        }
        if self.is_preparing_offer || pc.signaling_state() != SignalingState::Stable {
            debug!("Negotiation in flight; skipping ICE restart");
            return Ok(());
        }
        info!(peer = ?self.remote_peer, "Restarting ICE");
        self.send_offer(true).await
    }

    /// Drop the delegate, then end any call and stop timers.
    pub async fn shutdown(&mut self) {
        self.events = None;
        if self.call_state() != CallState::Idle {
            let _ = self.end_call().await;
        }
        self.adjustor.stop_all();
        self.cancel_timeout();
        if self.local_peer.take().is_some() {
            self.deps.signaling.disconnect();
        }
        debug!("Negotiation engine shut down");
    }

    // -----------------------------------------------------------------------
    // Configuration bracket
    // -----------------------------------------------------------------------

    pub fn start_configuration(&mut self) {
        self.is_configuring = true;
    }

    /// Close the bracket and negotiate, or postpone until signaling is stable.
    pub async fn commit_configuration(&mut self) -> CallResult<()> {
        self.is_configuring = false;
        let Some(pc) = self.pc.clone() else {
            return Ok(());
        };
        if pc.signaling_state() != SignalingState::Stable {
            debug!(state = ?pc.signaling_state(), "Signaling busy; postponing negotiation");
            self.is_commit_configuration_postponed = true;
            return Ok(());
        }
        self.trigger_negotiation().await
    }

    pub async fn trigger_negotiation(&mut self) -> CallResult<()> {
        if self.is_preparing_offer || self.is_configuring || !self.configuration_changed {
            return Ok(());
        }
        self.configuration_changed = false;
        self.send_offer(false).await
    }

    // -----------------------------------------------------------------------
    // Offer / answer
    // -----------------------------------------------------------------------

    fn constraints(&self, ice_restart: bool) -> MediaConstraints {
        MediaConstraints {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            ice_restart,
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) -> CallResult<()> {
        let pc = self.require_pc()?;
        self.is_preparing_offer = true;
        let result = async {
            let offer = pc
                .create_offer(self.constraints(ice_restart))
                .await
                .map_err(|e| CallError::negotiation("create offer", e))?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(|e| CallError::negotiation("set local offer", e))?;
            Ok::<_, CallError>(offer)
        }
        .await;
        self.is_preparing_offer = false;

        match result {
            Ok(offer) => {
                debug!(ice_restart, "Sending offer");
                self.send_message(SignalMessage::Description(offer)).await
            }
            Err(e) => {
                warn!("Offer aborted: {e}");
                Err(e)
            }
        }
    }

    /// Apply a remote offer and reply with an answer.
    async fn answer_offer(&mut self, offer: SessionDescription) -> CallResult<()> {
        let pc = self.require_pc()?;
        let result = async {
            pc.set_remote_description(offer)
                .await
                .map_err(|e| CallError::negotiation("set remote offer", e))?;
            self.drain_candidates().await;
            let answer = pc
                .create_answer(self.constraints(false))
                .await
                .map_err(|e| CallError::negotiation("create answer", e))?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(|e| CallError::negotiation("set local answer", e))?;
            Ok::<_, CallError>(answer)
        }
        .await;

        match result {
            Ok(answer) => {
                debug!("Sending answer");
                self.send_message(SignalMessage::Description(answer)).await
            }
            Err(e) => {
                warn!("Answer aborted: {e}");
                Err(e)
            }
        }
    }

    async fn handle_remote_offer(&mut self, from: PeerId, offer: SessionDescription) {
        match self.call_state() {
            CallState::Idle => {
                if let Err(e) = self.state.change_state(CallState::ReceivingRequest) {
                    warn!("Cannot take incoming call: {e}");
                    self.politeness_fixed = false;
                    return;
                }
                self.remote_peer = Some(from);
                self.received_offer = Some(offer);
                info!(peer = %from, "Incoming call");
                if let Some(d) = self.delegate() {
                    d.offer_received(from).await;
                }
                return;
            }
            CallState::ReceivingRequest => {
                debug!(peer = %from, "Updated offer before answer");
                self.received_offer = Some(offer);
                return;
            }
            _ => {}
        }

        let Some(pc) = self.pc.clone() else {
            warn!(peer = %from, "Offer without peer connection; ignoring");
            return;
        };
        let collision =
            self.is_preparing_offer || pc.signaling_state() != SignalingState::Stable;
        if collision && !self.is_polite {
            info!(peer = %from, "Offer collision; impolite side keeps its offer");
            return;
        }

        let renegotiation = self.call_state() == CallState::Running;
        if collision {
            info!(peer = %from, "Offer collision; rolling back local offer");
            if let Err(e) = pc.set_local_description(SessionDescription::rollback()).await {
                warn!("{}", CallError::negotiation("rollback", e));
                return;
            }
        }

        if self.answer_offer(offer).await.is_err() {
            return;
        }

        if self.call_state() == CallState::SendingRequest {
            // Our offer lost the collision; theirs doubles as acceptance.
            if let Err(e) = self.enter_connecting() {
                warn!("{e}");
                return;
            }
            if let Some(d) = self.delegate() {
                d.peer_accepted(from).await;
            }
        }

        if collision && renegotiation {
            self.configuration_changed = true;
            if let Err(e) = self.trigger_negotiation().await {
                warn!("Renegotiation after collision failed: {e}");
            }
        }
    }

    async fn handle_remote_answer(&mut self, from: PeerId, answer: SessionDescription) {
        let Some(pc) = self.pc.clone() else {
            warn!(peer = %from, "Answer without peer connection; ignoring");
            return;
        };
        if !matches!(
            pc.signaling_state(),
            SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer
        ) {
            warn!(state = ?pc.signaling_state(), "Unexpected answer; ignoring");
            return;
        }

        let is_first = pc
            .remote_description()
            .map_or(true, |d| d.sdp_type != SdpType::Answer);
        if let Err(e) = pc.set_remote_description(answer).await {
            warn!("{}", CallError::negotiation("set remote answer", e));
            return;
        }
        if !is_first {
            debug!(peer = %from, "ICE restart answer applied");
            return;
        }

        self.drain_candidates().await;
        if self.call_state() == CallState::SendingRequest {
            if let Err(e) = self.enter_connecting() {
                warn!("{e}");
                return;
            }
            info!(peer = %from, "Peer accepted");
            if let Some(d) = self.delegate() {
                d.peer_accepted(from).await;
            }
        }
        if is_connected(pc.as_ref()) {
            self.on_connected().await;
        }
    }

    async fn send_message(&mut self, msg: SignalMessage) -> CallResult<()> {
        let to = self
            .remote_peer
            .ok_or_else(|| CallError::Precondition("no remote peer".into()))?;
        let payload = self.deps.codec.encode(&msg)?;
        let sent = match msg {
            SignalMessage::Description(_) => self.deps.signaling.send_signal(payload, to).await,
            SignalMessage::Candidate(_) => {
                self.deps.signaling.send_ice_candidate(payload, to).await
            }
        };
        sent.map_err(|e| CallError::Signaling(e.to_string()))
    }

    async fn send_end_call(&self) {
        if let Some(to) = self.remote_peer {
            if let Err(e) = self.deps.signaling.send_end_call(to).await {
                warn!(peer = %to, "Failed to send end call: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // ICE candidates
    // -----------------------------------------------------------------------

    fn can_apply_candidates(&self) -> bool {
        self.pc.as_ref().is_some_and(|pc| {
            pc.ice_gathering_state() == IceGatheringState::Gathering
                && pc.remote_description().is_some()
        })
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.can_apply_candidates() {
            debug!(buffered = self.candidates.len() + 1, "Buffering remote candidate");
            self.candidates.store(candidate);
            return;
        }
        if let Some(pc) = self.pc.clone() {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Failed to add remote candidate: {e}");
            }
        }
    }

    /// Apply buffered candidates in arrival order while the gate stays open.
    async fn drain_candidates(&mut self) {
        if self.is_processing_candidates {
            return;
        }
        self.is_processing_candidates = true;
        while self.can_apply_candidates() {
            let Some(candidate) = self.candidates.pop_next() else {
                break;
            };
            let Some(pc) = self.pc.clone() else {
                break;
            };
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Failed to add buffered candidate: {e}");
            }
        }
        self.is_processing_candidates = false;
    }

    // -----------------------------------------------------------------------
    // Signaling events
    // -----------------------------------------------------------------------

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Signal {
                payload,
                from,
                is_polite,
            } => {
                let msg = match self.deps.codec.decode(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(peer = %from, "Undecodable signal: {e}");
                        return;
                    }
                };
                let starts_call = matches!(
                    &msg,
                    SignalMessage::Description(desc) if desc.sdp_type == SdpType::Offer
                );
                if self.remote_peer.is_none() && !starts_call {
                    debug!(peer = %from, "Signal outside any call; ignoring");
                    return;
                }
                if !self.accept_from(from).await {
                    return;
                }
                if !self.politeness_fixed {
                    self.is_polite = is_polite;
                    self.politeness_fixed = true;
                    debug!(peer = %from, is_polite, "Role fixed");
                }
                match msg {
                    SignalMessage::Description(desc) => match desc.sdp_type {
                        SdpType::Offer => self.handle_remote_offer(from, desc).await,
                        SdpType::Answer => self.handle_remote_answer(from, desc).await,
                        SdpType::ProvisionalAnswer => {
                            if let Some(pc) = self.pc.clone() {
                                if let Err(e) = pc.set_remote_description(desc).await {
                                    let err = CallError::negotiation("set provisional answer", e);
                                    warn!("{err}");
                                }
                            }
                        }
                        SdpType::Rollback => debug!(peer = %from, "Ignoring remote rollback"),
                    },
                    SignalMessage::Candidate(candidate) => {
                        self.handle_remote_candidate(candidate).await
                    }
                }
            }
            SignalingEvent::IceCandidate { payload, from } => {
                if self.remote_peer != Some(from) {
                    debug!(peer = %from, "Candidate from unrelated peer; ignoring");
                    return;
                }
                match self.deps.codec.decode(&payload) {
                    Ok(SignalMessage::Candidate(candidate)) => {
                        self.handle_remote_candidate(candidate).await
                    }
                    Ok(other) => warn!(peer = %from, ?other, "Expected a candidate"),
                    Err(e) => warn!(peer = %from, "Undecodable candidate: {e}"),
                }
            }
            SignalingEvent::EndCall { from } => {
                if self.call_state() == CallState::Idle || self.remote_peer != Some(from) {
                    debug!(peer = %from, "End call for no active call; ignoring");
                    return;
                }
                info!(peer = %from, "Remote ended call");
                let peer = self.teardown();
                self.notify_ended(peer, None).await;
            }
            SignalingEvent::PeerUnavailable { peer } => {
                if self.call_state() == CallState::Idle || self.remote_peer != Some(peer) {
                    return;
                }
                warn!(%peer, "Peer unavailable");
                let err = CallError::Signaling(format!("{peer} is unavailable"));
                let peer = self.teardown();
                self.notify_ended(peer, Some(&err)).await;
            }
            SignalingEvent::SocketOpened => debug!("Signaling socket opened"),
            SignalingEvent::SocketClosed => {
                info!("Signaling socket closed");
                self.local_peer = None;
                if self.call_state() != CallState::Idle {
                    let err = CallError::Signaling("signaling channel closed".into());
                    let peer = self.teardown();
                    self.notify_ended(peer, Some(&err)).await;
                }
            }
        }
    }

    /// Whether a signal from `from` belongs to the current call, or is an
    /// offer starting a new one while idle. Other callers get an immediate
    /// end call: there is no call waiting.
    async fn accept_from(&mut self, from: PeerId) -> bool {
        match self.remote_peer {
            None => true,
            Some(peer) if peer == from => true,
            Some(peer) => {
                info!(caller = %from, busy_with = %peer, "Busy; rejecting signal");
                if let Err(e) = self.deps.signaling.send_end_call(from).await {
                    warn!(peer = %from, "Failed to reject caller: {e}");
                }
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Peer connection events
    // -----------------------------------------------------------------------

    async fn handle_peer_connection(&mut self, event: PeerConnectionEvent) {
        if self.pc.is_none() {
            debug!(?event, "Peer connection event after teardown");
            return;
        }
        match event {
            PeerConnectionEvent::SignalingStateChanged(state) => {
                debug!(?state, "Signaling state");
                if state == SignalingState::Stable && self.is_commit_configuration_postponed {
                    self.is_commit_configuration_postponed = false;
                    if let Err(e) = self.trigger_negotiation().await {
                        warn!("Postponed negotiation failed: {e}");
                    }
                }
            }
            PeerConnectionEvent::IceGatheringStateChanged(state) => {
                debug!(?state, "ICE gathering state");
                if state == IceGatheringState::Gathering {
                    self.drain_candidates().await;
                }
            }
            PeerConnectionEvent::IceCandidateGenerated(candidate) => {
                if let Err(e) = self.send_message(SignalMessage::Candidate(candidate)).await {
                    warn!("Failed to send local candidate: {e}");
                }
            }
            PeerConnectionEvent::IceCandidatesRemoved(removed) => {
                debug!(count = removed.len(), "Local candidates removed");
            }
            PeerConnectionEvent::IceConnectionStateChanged(state) => {
                debug!(?state, "ICE connection state");
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.on_connected().await
                    }
                    IceConnectionState::Disconnected => self.on_disconnected().await,
                    IceConnectionState::Failed => {
                        self.end_with_error("ICE failed", CallError::ConnectionFailed)
                            .await
                    }
                    _ => {}
                }
            }
            PeerConnectionEvent::ConnectionStateChanged(state) => {
                debug!(?state, "Connection state");
                match state {
                    PeerConnectionState::Connected => self.on_connected().await,
                    PeerConnectionState::Failed => {
                        self.end_with_error("connection failed", CallError::ConnectionFailed)
                            .await
                    }
                    _ => {}
                }
            }
            PeerConnectionEvent::RemoteTrackAdded { kind, track_id } => {
                debug!(%kind, track_id = %track_id, "Remote track added");
                self.notify_track(TrackOrigin::Remote, kind, true).await;
            }
            PeerConnectionEvent::RemoteTrackRemoved { kind, track_id } => {
                debug!(%kind, track_id = %track_id, "Remote track removed");
                self.notify_track(TrackOrigin::Remote, kind, false).await;
            }
            PeerConnectionEvent::DataChannelOpened { label } => {
                info!(label = %label, "Remote data channel");
                if let Some(d) = self.delegate() {
                    d.data_channel_received(&label).await;
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        if self.call_state() != CallState::Connecting {
            return;
        }
        let Some(pc) = self.pc.clone() else {
            return;
        };
        self.cancel_timeout();
        if let Err(e) = self.state.change_state(CallState::Running) {
            warn!("{e}");
            return;
        }
        self.adjustor.start(MediaKind::Audio, pc.as_ref());
        if self.video_enabled {
            self.adjustor.start(MediaKind::Video, pc.as_ref());
        }
        if let Some(peer) = self.remote_peer {
            info!(%peer, "Call running");
            if let Some(d) = self.delegate() {
                d.call_started(peer).await;
            }
        }
    }

    async fn on_disconnected(&mut self) {
        if self.call_state() != CallState::Running {
            return;
        }
        let Some(peer) = self.remote_peer else {
            return;
        };
        warn!(%peer, "Peer connection lost");
        self.adjustor.stop_all();
        if let Err(e) = self.enter_connecting() {
            warn!("{e}");
            return;
        }
        if let Some(d) = self.delegate() {
            d.peer_connection_lost(peer).await;
        }
        // One side restarts; the other answers the restart offer.
        if !self.is_polite {
            if let Err(e) = self.restart_ice().await {
                warn!("ICE restart failed: {e}");
            }
        }
    }

    async fn handle_path(&mut self, status: PathStatus) {
        let previous = std::mem::replace(&mut self.path, status);
        debug!(?previous, ?status, "Network path");
        if previous == PathStatus::Unsatisfied
            && status == PathStatus::Satisfied
            && matches!(self.call_state(), CallState::Running | CallState::Connecting)
        {
            info!("Network path restored");
            if let Err(e) = self.restart_ice().await {
                warn!("ICE restart failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection watchdog
    // -----------------------------------------------------------------------

    /// Move to Connecting and (re)arm the watchdog.
    fn enter_connecting(&mut self) -> CallResult<()> {
        self.state.change_state(CallState::Connecting)?;
        self.cancel_timeout();
        let attempt = self.timeout_attempt;
        let timeout = self.config.connection_timeout();
        let queue = self.queue.clone();
        self.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = queue.send(SessionEvent::ConnectionTimeout { attempt });
        }));
        Ok(())
    }

    fn cancel_timeout(&mut self) {
        self.timeout_attempt += 1;
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }

    async fn handle_timeout(&mut self, attempt: u64) {
        // `cancel_timeout` bumps the counter, so a cancelled attempt never matches.
        if attempt != self.timeout_attempt || self.call_state() != CallState::Connecting {
            debug!(attempt, "Stale connection timeout");
            return;
        }
        let timeout = self.config.connection_timeout();
        self.end_with_error("connection timed out", CallError::ConnectionTimeout(timeout))
            .await;
    }

    // -----------------------------------------------------------------------
    // Setup / teardown
    // -----------------------------------------------------------------------

    async fn setup_peer_connection(&mut self, video: bool) -> CallResult<()> {
        let observer = Arc::new(QueueObserver::new(self.queue.clone()));
        let pc = self
            .deps
            .factory
            .create(&self.config.rtc_configuration(), observer)
            .map_err(|e| CallError::Other(e.context("create peer connection")))?;

        let mut kinds = vec![MediaKind::Audio];
        if video {
            kinds.push(MediaKind::Video);
        }
        for kind in &kinds {
            if let Err(e) = pc.add_track(*kind, kind.track_id()) {
                pc.close();
                return Err(CallError::Other(e.context(format!("add {kind} track"))));
            }
        }
        self.pc = Some(pc);
        self.video_enabled = video;
        for kind in kinds {
            self.notify_track(TrackOrigin::Local, kind, true).await;
        }
        Ok(())
    }

    /// Close everything belonging to the current call and return to Idle.
    /// Returns the peer the call was with.
    fn teardown(&mut self) -> Option<PeerId> {
        if let Err(e) = self.state.change_state(CallState::Ending) {
            warn!("{e}");
        }
        self.cancel_timeout();
        self.adjustor.stop_all();
        if let Some(pc) = self.pc.take() {
            pc.close();
        }
        self.candidates.clear();
        self.received_offer = None;
        self.is_polite = false;
        self.politeness_fixed = false;
        self.is_preparing_offer = false;
        self.is_configuring = false;
        self.is_commit_configuration_postponed = false;
        self.configuration_changed = false;
        self.is_processing_candidates = false;
        self.video_enabled = false;
        let peer = self.remote_peer.take();
        if let Err(e) = self.state.change_state(CallState::Idle) {
            warn!("{e}");
        }
        peer
    }

    /// Terminate the active call because of `err`, telling the remote side.
    async fn end_with_error(&mut self, reason: &str, err: CallError) {
        if self.call_state() == CallState::Idle {
            return;
        }
        warn!(peer = ?self.remote_peer, reason, "Ending call");
        self.send_end_call().await;
        let peer = self.teardown();
        self.notify_ended(peer, Some(&err)).await;
    }

    async fn notify_ended(&self, peer: Option<PeerId>, err: Option<&CallError>) {
        info!(peer = ?peer, error = ?err.map(ToString::to_string), "Call ended");
        if let Some(d) = self.delegate() {
            d.call_ended(peer, err).await;
        }
    }

    async fn notify_track(&self, origin: TrackOrigin, kind: MediaKind, added: bool) {
        let Some(d) = self.delegate() else {
            return;
        };
        if added {
            d.track_added(origin, kind).await;
        } else {
            d.track_removed(origin, kind).await;
        }
    }
}

fn is_connected(pc: &dyn PeerConnection) -> bool {
    matches!(
        pc.ice_connection_state(),
        IceConnectionState::Connected | IceConnectionState::Completed
    ) || pc.connection_state() == PeerConnectionState::Connected
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::adapters::call_events::{RecordedEvent, RecordingCallEvents};
    use crate::adapters::loopback::peer_connection::{
        LoopbackPeerConnection, LoopbackPeerConnectionFactory,
    };
    use crate::application::ports::PeerConnectionObserver;
    use crate::domain::peer::RtcConfiguration;
    use crate::adapters::loopback::signaling::{InMemorySignalingHub, NullSignalingObserver};
    use crate::adapters::signal_codec::CborSignalCodec;

    struct Fixture {
        engine: NegotiationEngine,
        factory: Arc<LoopbackPeerConnectionFactory>,
        hub: Arc<InMemorySignalingHub>,
        _events: Arc<RecordingCallEvents>,
        _rx: mpsc::UnboundedReceiver<SessionEvent>,
    }

    async fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = InMemorySignalingHub::new();
        let factory = Arc::new(LoopbackPeerConnectionFactory::new(false));
        let events = Arc::new(RecordingCallEvents::default());
        let delegate: Arc<dyn CallEvents> = events.clone();
        let mut engine = NegotiationEngine::new(
            SessionConfig::default(),
            EngineDeps {
                factory: factory.clone(),
                signaling: Arc::new(hub.channel()),
                codec: Arc::new(CborSignalCodec),
            },
            Arc::new(CallStateMachine::new()),
            Arc::downgrade(&delegate),
            tx,
        );
        engine.connect().await.unwrap();
        Fixture {
            engine,
            factory,
            hub,
            _events: events,
            _rx: rx,
        }
    }

    #[tokio::test]
    async fn negotiation_is_gated_by_configuration_bracket() {
        let mut f = fixture().await;
        let callee = f.hub.channel();
        let callee_id = callee.connect(Arc::new(NullSignalingObserver)).await.unwrap();

        f.engine.start_call(callee_id, false).await.unwrap();
        let pc = f.factory.last_created().unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);
        let offers = f.hub.routed().len();

        // Inside a bracket nothing is sent even if something changed.
        f.engine.start_configuration();
        f.engine.configuration_changed = true;
        f.engine.trigger_negotiation().await.unwrap();
        assert_eq!(f.hub.routed().len(), offers);

        // Commit while an offer is outstanding is postponed.
        f.engine.commit_configuration().await.unwrap();
        assert!(f.engine.is_commit_configuration_postponed);
        assert!(f.engine.configuration_changed);
        assert_eq!(f.hub.routed().len(), offers);
    }

    #[tokio::test]
    async fn trigger_without_changes_is_a_no_op() {
        let mut f = fixture().await;
        f.engine.trigger_negotiation().await.unwrap();
        assert!(f.hub.routed().is_empty());
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let mut f = fixture().await;
        let callee = f.hub.channel();
        let callee_id = callee.connect(Arc::new(NullSignalingObserver)).await.unwrap();
        f.engine.start_call(callee_id, false).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:9 1 udp 1 10.0.0.9 9 typ host".into(),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        };
        f.engine.handle_remote_candidate(candidate).await;
        assert_eq!(f.engine.buffered_candidates(), 1);
        assert!(f.factory.last_created().unwrap().applied_remote_candidates().is_empty());
    }

    #[tokio::test]
    async fn end_call_while_idle_is_ignored() {
        let mut f = fixture().await;
        f.engine.end_call().await.unwrap();
        assert_eq!(f.engine.call_state(), CallState::Idle);
        assert!(f.hub.routed().is_empty());
    }

    /// Hands out connections that already carry an audio track, so the
    /// engine's own `add_track` fails halfway through setup.
    #[derive(Default)]
    struct PreloadedFactory {
        last: parking_lot::Mutex<Option<Arc<LoopbackPeerConnection>>>,
    }

    impl PeerConnectionFactory for PreloadedFactory {
        fn create(
            &self,
            _config: &RtcConfiguration,
            observer: Arc<dyn PeerConnectionObserver>,
        ) -> anyhow::Result<Arc<dyn PeerConnection>> {
            let pc = Arc::new(LoopbackPeerConnection::new(observer, false));
            pc.add_track(MediaKind::Audio, "leftover")?;
            *self.last.lock() = Some(Arc::clone(&pc));
            Ok(pc)
        }
    }

    #[tokio::test]
    async fn failed_setup_closes_the_partial_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let hub = InMemorySignalingHub::new();
        let factory = Arc::new(PreloadedFactory::default());
        let events = Arc::new(RecordingCallEvents::default());
        let delegate: Arc<dyn CallEvents> = events.clone();
        let mut engine = NegotiationEngine::new(
            SessionConfig::default(),
            EngineDeps {
                factory: factory.clone(),
                signaling: Arc::new(hub.channel()),
                codec: Arc::new(CborSignalCodec),
            },
            Arc::new(CallStateMachine::new()),
            Arc::downgrade(&delegate),
            tx,
        );
        engine.connect().await.unwrap();
        let callee = hub.channel();
        let callee_id = callee.connect(Arc::new(NullSignalingObserver)).await.unwrap();

        assert!(matches!(
            engine.start_call(callee_id, false).await,
            Err(CallError::Other(_))
        ));
        assert!(factory.last.lock().as_ref().unwrap().is_closed());
        assert!(engine.peer_connection().is_none());
        assert_eq!(engine.call_state(), CallState::Idle);
        assert_eq!(events.count(|e| matches!(e, RecordedEvent::CallEnded(_, Some(_)))), 1);
    }
}
