//! CallManager: handle on one call session.
//!
//! Translates user and call-UI intents into [`CallCommand`]s for the session
//! actor and waits for their replies. Cheap state reads go straight to the
//! shared [`CallStateMachine`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::call_state::{CallState, CallStateMachine};
use crate::domain::config::SessionConfig;
use crate::domain::error::CallError;
use crate::domain::identity::PeerId;
use crate::domain::peer::DataChannelConfig;

use super::negotiation::{EngineDeps, NegotiationEngine};
use super::ports::{CallEvents, NetworkPathMonitor, PathStatus};
use super::session::{run_session, CallCommand, Reply, SessionEvent, SessionQueue};

pub struct CallManager {
    queue: SessionQueue,
    state: Arc<CallStateMachine>,
    actor: Mutex<Option<JoinHandle<()>>>,
    path_forwarder: Option<JoinHandle<()>>,
}

impl CallManager {
    /// Validate `config`, then spawn the session actor (and a path-monitor
    /// forwarder if a monitor is given). `events` is held weakly; keep it
    /// alive for as long as notifications are wanted.
    pub fn spawn(
        config: SessionConfig,
        deps: EngineDeps,
        events: &Arc<dyn CallEvents>,
        path_monitor: Option<Arc<dyn NetworkPathMonitor>>,
    ) -> Result<Self, CallError> {
        config.validate()?;

        let (queue, rx) = mpsc::unbounded_channel();
        let state = Arc::new(CallStateMachine::new());
        let engine = NegotiationEngine::new(
            config,
            deps,
            Arc::clone(&state),
            Arc::downgrade(events),
            queue.clone(),
        );
        let actor = tokio::spawn(run_session(engine, rx));
        let path_forwarder =
            path_monitor.map(|monitor| spawn_path_forwarder(monitor.subscribe(), queue.clone()));

        Ok(Self {
            queue,
            state,
            actor: Mutex::new(Some(actor)),
            path_forwarder,
        })
    }

    pub fn state(&self) -> CallState {
        self.state.state()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(SessionEvent::Command(build(reply)))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Register with signaling; returns our peer id.
    pub async fn connect(&self) -> Result<PeerId, CallError> {
        self.request(|reply| CallCommand::Connect { reply }).await
    }

    pub async fn start_call(&self, to: PeerId, video: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::StartCall { to, video, reply })
            .await
    }

    pub async fn answer_call(&self, video: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::AnswerCall { video, reply })
            .await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::EndCall { reply }).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetVideoEnabled { enabled, reply })
            .await
    }

    pub async fn open_data_channel(
        &self,
        label: impl Into<String>,
        config: DataChannelConfig,
    ) -> Result<(), CallError> {
        let label = label.into();
        self.request(|reply| CallCommand::OpenDataChannel {
            label,
            config,
            reply,
        })
        .await
    }

    pub async fn restart_ice(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::RestartIce { reply }).await
    }

    /// End any call, disconnect signaling and stop the actor. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(forwarder) = &self.path_forwarder {
            forwarder.abort();
        }
        let Some(actor) = self.actor.lock().take() else {
            return;
        };
        let (done, rx) = oneshot::channel();
        if self
            .queue
            .send(SessionEvent::Command(CallCommand::Shutdown { done }))
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = actor.await;
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        if let Some(forwarder) = &self.path_forwarder {
            forwarder.abort();
        }
        if self.actor.lock().take().is_some() {
            let (done, _rx) = oneshot::channel();
            let _ = self
                .queue
                .send(SessionEvent::Command(CallCommand::Shutdown { done }));
        }
    }
}

fn stopped() -> CallError {
    CallError::Precondition("call session stopped".into())
}

fn spawn_path_forwarder(
    mut rx: watch::Receiver<PathStatus>,
    queue: SessionQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = *rx.borrow_and_update();
            if queue.send(SessionEvent::NetworkPath(status)).is_err() {
                break;
            }
        }
        debug!("Path forwarder stopped");
    })
}
