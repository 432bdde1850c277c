//! Per-participant negotiation state machine.
//!
//! The agent runs as a single task that owns its [`NegotiationSession`].
//! Commands, relayed frames and transport events are handled one at a
//! time, so a frame that arrives while a description operation is pending
//! simply waits its turn and no two local descriptions are ever created
//! concurrently.
//!
//! Nothing that fails inside the agent takes it down: the failure is logged,
//! recorded in the status and the session stops advancing.

use std::collections::VecDeque;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, CandidatePolicy};
use crate::connection::{AgentStatus, NegotiationState, Role, StatusMonitor};
use crate::engine::{EngineEvent, LocalMedia, MediaSource, NegotiationEngine};
use crate::error::{Error, Result};
use crate::signaling::{Candidate, ClientMessage, Description, ServerMessage, SignalSender, Subscription};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    StartOffer,
    Close,
}

/// Negotiation bookkeeping for one room.
#[derive(Debug)]
pub struct NegotiationSession {
    pub role: Option<Role>,
    pub local_description: Option<Description>,
    pub remote_description: Option<Description>,
    /// Local candidates not yet handed to the relay link.
    pub candidate_outbox: VecDeque<Candidate>,
    /// Remote candidates held until a remote description exists.
    pub pending_remote: VecDeque<Candidate>,
    pub state: NegotiationState,
}

impl NegotiationSession {
    fn new() -> Self {
        Self {
            role: None,
            local_description: None,
            remote_description: None,
            candidate_outbox: VecDeque::new(),
            pending_remote: VecDeque::new(),
            state: NegotiationState::Idle,
        }
    }
}

/// Control surface of a running agent. Dropping it tears the agent down.
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<AgentCommand>,
    monitor: StatusMonitor,
    task: JoinHandle<()>,
}

impl AgentHandle {
    /// Asks the agent to become the offerer. Returns false once it is gone.
    pub fn start_offer(&self) -> bool {
        self.commands.send(AgentCommand::StartOffer).is_ok()
    }

    /// Requests teardown; repeated calls are harmless.
    pub fn close(&self) {
        let _ = self.commands.send(AgentCommand::Close);
    }

    pub fn status(&self) -> AgentStatus {
        self.monitor.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.monitor.subscribe()
    }

    /// Waits for the agent task to finish tearing down.
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            warn!("Negotiation agent task ended abnormally: {}", e);
        }
    }
}

pub struct NegotiationAgent<E, S> {
    config: AgentConfig,
    engine: E,
    media_source: S,
    media: Option<LocalMedia>,
    outbound: SignalSender,
    session: NegotiationSession,
    monitor: StatusMonitor,
}

impl<E, S> NegotiationAgent<E, S>
where
    E: NegotiationEngine + 'static,
    S: MediaSource + 'static,
{
    /// Starts an agent on its own task. `subscription` is the agent's only
    /// inbound listener and is released when the agent closes.
    pub fn spawn(
        config: AgentConfig,
        engine: E,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        media_source: S,
        outbound: SignalSender,
        subscription: Subscription,
    ) -> AgentHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let monitor = StatusMonitor::new();
        let agent = Self {
            config,
            engine,
            media_source,
            media: None,
            outbound,
            session: NegotiationSession::new(),
            monitor: monitor.clone(),
        };
        let task = tokio::spawn(agent.run(commands_rx, events, subscription));
        AgentHandle {
            commands: commands_tx,
            monitor,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        mut subscription: Subscription,
    ) {
        self.acquire_media().await;
        self.join_room().await;

        let mut signaling_open = true;
        let mut engine_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(AgentCommand::StartOffer) => self.start_offer().await,
                    Some(AgentCommand::Close) | None => break,
                },
                frame = subscription.recv(), if signaling_open => match frame {
                    Some(frame) => self.handle_signal(frame).await,
                    None => {
                        warn!("Signaling link closed; no further frames for room {}", self.config.room_id);
                        signaling_open = false;
                    }
                },
                event = events.recv(), if engine_open => match event {
                    Some(EngineEvent::Closed) => {
                        info!("Transport closed");
                        break;
                    }
                    Some(event) => self.handle_engine_event(event).await,
                    None => engine_open = false,
                },
            }
        }

        drop(subscription);
        self.teardown().await;
    }

    fn transition(&mut self, state: NegotiationState) {
        if self.session.state != state {
            debug!("Negotiation state {} -> {}", self.session.state, state);
            self.session.state = state;
            self.monitor.update_state(state);
        }
    }

    fn set_role(&mut self, role: Option<Role>) {
        self.session.role = role;
        self.monitor.set_role(role);
    }

    fn report(&self, context: &str, error: Error) {
        warn!("{} failed ({}): {}", context, error.kind(), error);
        self.monitor.set_error(&error);
    }

    async fn acquire_media(&mut self) {
        let media = match self.media_source.acquire().await {
            Ok(media) => media,
            Err(e) => {
                self.report("Media access", e);
                return;
            }
        };
        if let Err(e) = self.engine.attach_media(&media).await {
            self.report("Attaching media", e);
            return;
        }
        info!("Local media '{}' ready ({} track(s))", media.label, media.tracks.len());
        self.media = Some(media);
        self.transition(NegotiationState::MediaReady);
    }

    async fn join_room(&mut self) {
        let msg = ClientMessage::JoinRoom {
            room_id: self.config.room_id.clone(),
        };
        if let Err(e) = self.outbound.send(msg).await {
            self.report("Joining room", e);
        }
    }

    async fn start_offer(&mut self) {
        // An offer that was never answered (lost in an empty room, say) may
        // be replaced by a fresh one.
        let can_offer = match self.session.state {
            NegotiationState::MediaReady => true,
            NegotiationState::Negotiating => self.session.remote_description.is_none(),
            _ => false,
        };
        if !can_offer {
            warn!("Ignoring offer request in state {}", self.session.state);
            return;
        }
        if self.session.local_description.is_some() {
            info!("Re-offering in room {}", self.config.room_id);
        }
        if let Err(e) = self.create_and_send_offer().await {
            self.report("Offer creation", e);
        }
    }

    async fn create_and_send_offer(&mut self) -> Result<()> {
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        self.session.local_description = Some(offer.clone());
        self.set_role(Some(Role::Offerer));
        self.transition(NegotiationState::Negotiating);

        self.outbound
            .send(ClientMessage::Offer {
                room_id: self.config.room_id.clone(),
                description: offer,
            })
            .await
    }

    async fn handle_signal(&mut self, frame: ServerMessage) {
        match frame {
            ServerMessage::JoinedRoom { room_id } => {
                if room_id == self.config.room_id {
                    info!("Membership of room {} announced", room_id);
                    self.monitor.record_announcement();
                } else {
                    debug!("Ignoring announcement for room {}", room_id);
                }
            }
            ServerMessage::Offer { description } => self.handle_offer(description).await,
            ServerMessage::Answer { description } => self.handle_answer(description).await,
            ServerMessage::IceCandidate { candidate } => self.handle_remote_candidate(candidate).await,
        }
    }

    async fn handle_offer(&mut self, offer: Description) {
        match self.session.state {
            NegotiationState::MediaReady | NegotiationState::Negotiating => {}
            state => {
                warn!("Ignoring offer in state {}", state);
                return;
            }
        }
        if self.awaiting_answer() {
            if let Err(e) = self.discard_local_offer().await {
                self.report("Discarding local offer", e);
                warn!("Ignoring offer while our own is outstanding");
                return;
            }
        }
        if let Err(e) = self.answer_offer(offer).await {
            self.report("Offer handling", e);
        }
    }

    /// Drops our unanswered offer in favour of the peer's.
    async fn discard_local_offer(&mut self) -> Result<()> {
        self.engine.discard_local_offer().await?;
        info!("Peer offered first, answering instead of offering");
        self.session.local_description = None;
        self.set_role(None);
        self.transition(NegotiationState::MediaReady);
        Ok(())
    }

    async fn answer_offer(&mut self, offer: Description) -> Result<()> {
        self.engine.set_remote_description(offer.clone()).await?;
        self.session.remote_description = Some(offer);
        self.set_role(Some(Role::Answerer));
        self.transition(NegotiationState::Negotiating);
        self.flush_pending_remote().await;

        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        self.session.local_description = Some(answer.clone());

        self.outbound
            .send(ClientMessage::Answer {
                room_id: self.config.room_id.clone(),
                description: answer,
            })
            .await
    }

    fn awaiting_answer(&self) -> bool {
        self.session.state == NegotiationState::Negotiating
            && self.session.role == Some(Role::Offerer)
            && self.session.remote_description.is_none()
    }

    async fn handle_answer(&mut self, answer: Description) {
        if !self.awaiting_answer() {
            debug!("Ignoring answer in state {} with role {:?}", self.session.state, self.session.role);
            return;
        }

        if let Err(e) = self.engine.set_remote_description(answer.clone()).await {
            self.report("Answer handling", e);
            return;
        }
        self.session.remote_description = Some(answer);
        self.flush_pending_remote().await;
        self.transition(NegotiationState::Connected);
    }

    async fn handle_remote_candidate(&mut self, candidate: Candidate) {
        if self.session.remote_description.is_none() && self.config.candidate_policy == CandidatePolicy::Buffer {
            if self.session.pending_remote.len() >= self.config.max_pending_candidates {
                warn!(
                    "Dropping early remote candidate, {} already pending",
                    self.session.pending_remote.len()
                );
                self.monitor.record_candidate_lost();
                return;
            }
            debug!("Buffering remote candidate until a remote description is applied");
            self.session.pending_remote.push_back(candidate);
            return;
        }
        self.apply_remote_candidate(candidate).await;
    }

    async fn apply_remote_candidate(&mut self, candidate: Candidate) {
        match self.engine.add_ice_candidate(candidate).await {
            Ok(()) => self.monitor.record_candidate_applied(),
            Err(e) => {
                self.monitor.record_candidate_lost();
                self.report("ICE candidate", e);
            }
        }
    }

    async fn flush_pending_remote(&mut self) {
        while let Some(candidate) = self.session.pending_remote.pop_front() {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.session.candidate_outbox.push_back(candidate);
                self.flush_outbox().await;
            }
            EngineEvent::Connected => {
                if self.session.state == NegotiationState::Negotiating {
                    self.transition(NegotiationState::Connected);
                }
            }
            EngineEvent::Failed(reason) => self.report("Transport", Error::Transport(reason)),
            EngineEvent::Closed => {}
        }
    }

    async fn flush_outbox(&mut self) {
        while let Some(candidate) = self.session.candidate_outbox.front().cloned() {
            let msg = ClientMessage::IceCandidate {
                room_id: self.config.room_id.clone(),
                candidate,
            };
            if let Err(e) = self.outbound.send(msg).await {
                self.report("Sending ICE candidate", e);
                return;
            }
            self.session.candidate_outbox.pop_front();
            self.monitor.record_candidate_sent();
        }
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.engine.close().await {
            self.report("Closing transport", e);
        }
        self.media = None;
        self.session.pending_remote.clear();
        self.session.candidate_outbox.clear();
        self.transition(NegotiationState::Closed);
        info!("Negotiation agent for room {} closed", self.config.room_id);
    }
}
