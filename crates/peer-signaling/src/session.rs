//! Per-peer negotiation state machine.
//!
//! A [`PeerSession`] never blocks on the transport: every transport call is
//! queued on its [`NegotiationWorker`] and the result comes back later as a
//! [`SessionInput::Completion`] stamped with the session generation. The
//! registry feeds those inputs through [`PeerSession::handle`] while holding
//! the peer's lock, so all mutation for one identity is serialized.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::candidate::IceCandidate;
use crate::channel::DataChannelManager;
use crate::error::{ChannelError, SessionError};
use crate::identity::PeerId;
use crate::metrics;
use crate::negotiation::{
    Completion, NegotiationStep, NegotiationWorker, OpOutcome, StepFailure, TransportOp,
};
use crate::outbound::{OutboundEnvelope, SignalPublisher};
use crate::router::{MessageKind, SignalingEvent};
use crate::transport::{
    DataChannel, LinkState, MediaKind, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory,
};

/// Remote candidates held per session while descriptions are missing.
pub const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// What a fresh session does when a peer says hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelloResponse {
    /// Build the transport and wait for the caller's offer.
    #[default]
    AwaitOffer,
    /// Build the transport and offer to the caller.
    Offer,
}

/// Status notifications for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        peer: PeerId,
        generation: u64,
        state: SessionState,
    },
    Connected {
        peer: PeerId,
    },
    Disconnected {
        peer: PeerId,
        reason: Option<String>,
    },
    Message {
        peer: PeerId,
        text: String,
    },
    /// The peer started sending media on a new track.
    Track {
        peer: PeerId,
        track_id: String,
        kind: MediaKind,
    },
}

/// Everything that can reach a session through its peer inbox.
#[derive(Debug)]
pub enum SessionInput {
    Signal(SignalingEvent),
    Completion(Completion),
    Transport { generation: u64, event: TransportEvent },
    /// Close the data channel on behalf of the channel manager.
    CloseChannel(oneshot::Sender<Result<(), ChannelError>>),
}

/// What the registry must do after an input was handled.
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    /// Session just reached `Connected`; the channel manager takes over.
    Connected,
    /// The peer restarted; tear down and replay the event on a fresh session.
    Replace(SignalingEvent),
    /// Session reached a terminal state with its resources released.
    Ended,
}

pub(crate) struct SessionContext {
    pub publisher: SignalPublisher,
    pub factory: Arc<dyn TransportFactory>,
    pub channels: DataChannelManager,
    pub events: broadcast::Sender<SessionEvent>,
    pub hello_response: HelloResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer: PeerId,
    pub generation: u64,
    pub state: SessionState,
    pub role: Option<Role>,
    pub pending_candidates: usize,
    pub channel_open: bool,
}

pub struct PeerSession {
    peer: PeerId,
    generation: u64,
    state: SessionState,
    role: Option<Role>,
    ctx: Arc<SessionContext>,
    inbox: mpsc::UnboundedSender<SessionInput>,
    transport: Option<Arc<dyn PeerTransport>>,
    worker: Option<NegotiationWorker>,
    channel: Option<Arc<dyn DataChannel>>,
    channel_requested: bool,
    pending_remote: VecDeque<IceCandidate>,
    seen_candidates: HashSet<String>,
    pending_local: Vec<String>,
    local_described: bool,
    remote_described: bool,
    answer_in_flight: bool,
    remote_offer: Option<String>,
}

impl PeerSession {
    pub(crate) fn new(
        peer: PeerId,
        generation: u64,
        ctx: Arc<SessionContext>,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        metrics::SESSIONS_ACTIVE.inc();
        debug!(target = "signaling.session", peer = %peer, generation, "session created");
        Self {
            peer,
            generation,
            state: SessionState::New,
            role: None,
            ctx,
            inbox,
            transport: None,
            worker: None,
            channel: None,
            channel_requested: false,
            pending_remote: VecDeque::new(),
            seen_candidates: HashSet::new(),
            pending_local: Vec::new(),
            local_described: false,
            remote_described: false,
            answer_in_flight: false,
            remote_offer: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Remote candidates waiting for both descriptions.
    pub fn pending_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer: self.peer.clone(),
            generation: self.generation,
            state: self.state,
            role: self.role,
            pending_candidates: self.pending_remote.len(),
            channel_open: self.channel.as_ref().is_some_and(|c| c.is_open()),
        }
    }

    /// Local call initiation: build the transport and offer.
    pub async fn initiate(&mut self) -> Result<(), SessionError> {
        self.start(Role::Offerer).await?;
        self.submit(TransportOp::CreateOffer);
        Ok(())
    }

    /// Build the transport and wait for the peer to offer.
    pub async fn await_offer(&mut self) -> Result<(), SessionError> {
        self.start(Role::Answerer).await
    }

    /// Explicit teardown: `Closing` then `Closed`. The channel is released
    /// before the transport and both releases are always attempted.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let was_started = self.state != SessionState::New;
        self.transition(SessionState::Closing);
        let failures = self.release().await;
        self.transition(SessionState::Closed);
        if was_started {
            self.notify(SessionEvent::Disconnected {
                peer: self.peer.clone(),
                reason: None,
            });
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Release {
                peer: self.peer.clone(),
                failures,
            })
        }
    }

    pub(crate) fn publish_hello(&mut self) -> Result<(), SessionError> {
        let me = self.ctx.publisher.self_id().to_string();
        self.publish(MessageKind::Hello, me)
    }

    pub(crate) fn request_channel(&mut self, label: &str) -> Result<(), ChannelError> {
        if self.state != SessionState::Connected {
            return Err(ChannelError::NotConnected {
                peer: self.peer.clone(),
                state: self.state.as_str(),
            });
        }
        if self.channel.is_none() && !self.channel_requested {
            self.channel_requested = true;
            self.submit(TransportOp::OpenChannel(label.to_string()));
        }
        Ok(())
    }

    /// Drops the data channel so it can be requested again. Closing a
    /// session without a channel is a no-op.
    pub async fn close_channel(&mut self) -> Result<(), ChannelError> {
        self.channel_requested = false;
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };
        self.ctx.channels.unregister(&self.peer, &channel);
        channel.close().await.map_err(|source| {
            warn!(target = "signaling.session", peer = %self.peer, error = %source, "channel close failed");
            ChannelError::Close {
                peer: self.peer.clone(),
                source,
            }
        })
    }

    pub(crate) async fn handle(&mut self, input: SessionInput) -> Flow {
        if let SessionInput::CloseChannel(reply) = input {
            let _ = reply.send(self.close_channel().await);
            return Flow::Continue;
        }
        if self.state.is_terminal() {
            debug!(target = "signaling.session", peer = %self.peer, state = %self.state, "input for finished session ignored");
            return Flow::Continue;
        }
        match input {
            SessionInput::Signal(event) => self.on_signal(event).await,
            SessionInput::Completion(Completion { generation, result }) => {
                if generation != self.generation {
                    debug!(target = "signaling.session", peer = %self.peer, stale = generation, current = self.generation, "stale completion dropped");
                    return Flow::Continue;
                }
                self.on_completion(result).await
            }
            SessionInput::Transport { generation, event } => {
                if generation != self.generation {
                    debug!(target = "signaling.session", peer = %self.peer, stale = generation, current = self.generation, "stale transport event dropped");
                    return Flow::Continue;
                }
                self.on_transport(event).await
            }
            SessionInput::CloseChannel(_) => Flow::Continue,
        }
    }

    async fn on_signal(&mut self, event: SignalingEvent) -> Flow {
        match event {
            SignalingEvent::Hello { .. } => self.on_hello(event).await,
            SignalingEvent::Offer { .. } => self.on_offer(event).await,
            SignalingEvent::Answer { sdp, .. } => {
                self.on_answer(sdp);
                Flow::Continue
            }
            SignalingEvent::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(&candidate);
                Flow::Continue
            }
        }
    }

    async fn on_hello(&mut self, event: SignalingEvent) -> Flow {
        match self.state {
            SessionState::New => {
                let started = match self.ctx.hello_response {
                    HelloResponse::AwaitOffer => self.start(Role::Answerer).await,
                    HelloResponse::Offer => self.initiate().await,
                };
                match started {
                    Ok(()) => Flow::Continue,
                    Err(_) => Flow::Ended,
                }
            }
            SessionState::Negotiating
                if self.role == Some(Role::Answerer) && self.remote_offer.is_none() =>
            {
                debug!(target = "signaling.session", peer = %self.peer, "repeated hello while awaiting offer");
                Flow::Continue
            }
            SessionState::Negotiating | SessionState::Connected => {
                info!(target = "signaling.session", peer = %self.peer, state = %self.state, "hello from running peer; restarting session");
                Flow::Replace(event)
            }
            _ => Flow::Continue,
        }
    }

    async fn on_offer(&mut self, event: SignalingEvent) -> Flow {
        let SignalingEvent::Offer { sdp, .. } = &event else {
            return Flow::Continue;
        };
        match (self.state, self.role) {
            (SessionState::New, _) => {
                if self.start(Role::Answerer).await.is_err() {
                    return Flow::Ended;
                }
                self.accept_offer(sdp.clone());
                Flow::Continue
            }
            (SessionState::Negotiating, Some(Role::Answerer)) => match &self.remote_offer {
                None => {
                    self.accept_offer(sdp.clone());
                    Flow::Continue
                }
                Some(applied) if applied == sdp => {
                    debug!(target = "signaling.session", peer = %self.peer, "duplicate offer ignored");
                    Flow::Continue
                }
                Some(_) => Flow::Replace(event),
            },
            (SessionState::Negotiating, _) => {
                // both sides offered; the lower identity keeps its offer
                if self.ctx.publisher.self_id() < &self.peer {
                    info!(target = "signaling.session", peer = %self.peer, "offer collision; keeping local offer");
                    Flow::Continue
                } else {
                    info!(target = "signaling.session", peer = %self.peer, "offer collision; yielding to remote offer");
                    Flow::Replace(event)
                }
            }
            (SessionState::Connected, _) => {
                if self.remote_offer.as_deref() == Some(sdp.as_str()) {
                    debug!(target = "signaling.session", peer = %self.peer, "duplicate offer after connect ignored");
                    Flow::Continue
                } else {
                    info!(target = "signaling.session", peer = %self.peer, "offer while connected; peer restarted");
                    Flow::Replace(event)
                }
            }
            _ => Flow::Continue,
        }
    }

    fn on_answer(&mut self, sdp: String) {
        if self.state != SessionState::Negotiating || self.role != Some(Role::Offerer) {
            debug!(target = "signaling.session", peer = %self.peer, state = %self.state, "unsolicited answer ignored");
            return;
        }
        if self.remote_described || self.answer_in_flight {
            debug!(target = "signaling.session", peer = %self.peer, "duplicate answer ignored");
            return;
        }
        if !self.local_described {
            warn!(target = "signaling.session", peer = %self.peer, "answer arrived before local offer was installed");
            return;
        }
        self.answer_in_flight = true;
        self.submit(TransportOp::AcceptAnswer(sdp));
    }

    fn on_remote_candidate(&mut self, raw: &str) {
        let candidate = match IceCandidate::parse(raw) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(target = "signaling.session", peer = %self.peer, error = %err, "skipping invalid candidate");
                metrics::CANDIDATES.with_label_values(&["invalid"]).inc();
                return;
            }
        };
        if !self.seen_candidates.insert(candidate.as_str().to_string()) {
            debug!(target = "signaling.session", peer = %self.peer, candidate = %candidate, "duplicate candidate ignored");
            metrics::CANDIDATES.with_label_values(&["duplicate"]).inc();
            return;
        }
        if self.ready_for_candidates() {
            self.submit(TransportOp::AddCandidate(candidate));
        } else if self.pending_remote.len() >= MAX_PENDING_CANDIDATES {
            warn!(target = "signaling.session", peer = %self.peer, limit = MAX_PENDING_CANDIDATES, "candidate buffer full; dropping candidate");
            metrics::CANDIDATES.with_label_values(&["overflow"]).inc();
            self.seen_candidates.remove(candidate.as_str());
        } else {
            metrics::CANDIDATES.with_label_values(&["buffered"]).inc();
            self.pending_remote.push_back(candidate);
        }
    }

    async fn on_completion(&mut self, result: Result<OpOutcome, StepFailure>) -> Flow {
        match result {
            Ok(OpOutcome::OfferReady(sdp)) => {
                self.local_described = true;
                if let Err(err) = self.publish_description(MessageKind::Offer, sdp) {
                    self.fail(err).await;
                    return Flow::Ended;
                }
                self.flush_candidates();
                Flow::Continue
            }
            Ok(OpOutcome::AnswerReady(sdp)) => {
                self.remote_described = true;
                self.local_described = true;
                if let Err(err) = self.publish_description(MessageKind::Answer, sdp) {
                    self.fail(err).await;
                    return Flow::Ended;
                }
                self.flush_candidates();
                Flow::Continue
            }
            Ok(OpOutcome::AnswerApplied) => {
                self.remote_described = true;
                self.answer_in_flight = false;
                self.flush_candidates();
                Flow::Continue
            }
            Ok(OpOutcome::CandidateAdded(candidate)) => {
                debug!(target = "signaling.session", peer = %self.peer, candidate = %candidate, "remote candidate applied");
                metrics::CANDIDATES.with_label_values(&["applied"]).inc();
                Flow::Continue
            }
            Ok(OpOutcome::ChannelOpened(channel)) => {
                if self.state == SessionState::Connected && self.channel.is_none() {
                    info!(target = "signaling.session", peer = %self.peer, label = channel.label(), "data channel attached");
                    self.ctx.channels.register(&self.peer, &channel, &self.inbox);
                    self.channel = Some(channel);
                } else if let Err(err) = channel.close().await {
                    debug!(target = "signaling.session", peer = %self.peer, error = %err, "closing surplus channel failed");
                }
                Flow::Continue
            }
            Err(StepFailure { step, error }) if step.is_recoverable() => {
                warn!(target = "signaling.session", peer = %self.peer, step = %step, error = %error, "transport step failed; session continues");
                match step {
                    NegotiationStep::OpenChannel => self.channel_requested = false,
                    _ => metrics::CANDIDATES.with_label_values(&["rejected"]).inc(),
                }
                Flow::Continue
            }
            Err(StepFailure { step, error }) => {
                self.fail(SessionError::NegotiationFailed {
                    peer: self.peer.clone(),
                    step,
                    source: error,
                })
                .await;
                Flow::Ended
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::LocalCandidate(line) => {
                if !matches!(self.state, SessionState::Negotiating | SessionState::Connected) {
                    return Flow::Continue;
                }
                if !self.local_described {
                    // trickled only after our offer or answer went out
                    self.pending_local.push(line);
                    return Flow::Continue;
                }
                match self.publish(MessageKind::Ice, line) {
                    Ok(()) => Flow::Continue,
                    Err(err) => {
                        self.fail(err).await;
                        Flow::Ended
                    }
                }
            }
            TransportEvent::Link(LinkState::Connected) => {
                if self.state != SessionState::Negotiating {
                    return Flow::Continue;
                }
                self.transition(SessionState::Connected);
                self.notify(SessionEvent::Connected {
                    peer: self.peer.clone(),
                });
                Flow::Connected
            }
            TransportEvent::Link(state @ (LinkState::Failed | LinkState::Closed)) => {
                if self.state == SessionState::Connected {
                    info!(target = "signaling.session", peer = %self.peer, link = %state, "transport lost; closing session");
                    if let Err(err) = self.close().await {
                        warn!(target = "signaling.session", peer = %self.peer, error = %err, "release after transport loss incomplete");
                    }
                } else {
                    let lost = match state {
                        LinkState::Failed => "failed",
                        _ => "closed",
                    };
                    self.fail(SessionError::TransportLost {
                        peer: self.peer.clone(),
                        state: lost,
                    })
                    .await;
                }
                Flow::Ended
            }
            TransportEvent::Link(LinkState::Disconnected) => {
                warn!(target = "signaling.session", peer = %self.peer, "transport disconnected; waiting for recovery");
                Flow::Continue
            }
            TransportEvent::Link(state) => {
                debug!(target = "signaling.session", peer = %self.peer, link = %state, "link state");
                Flow::Continue
            }
            TransportEvent::ChannelMessage(text) => {
                self.notify(SessionEvent::Message {
                    peer: self.peer.clone(),
                    text,
                });
                Flow::Continue
            }
            TransportEvent::RemoteTrack { id, kind } => {
                info!(target = "signaling.session", peer = %self.peer, track = %id, kind = %kind, "remote track added");
                self.notify(SessionEvent::Track {
                    peer: self.peer.clone(),
                    track_id: id,
                    kind,
                });
                Flow::Continue
            }
            TransportEvent::ChannelClosed => {
                if let Some(channel) = self.channel.take_if(|c| !c.is_open()) {
                    debug!(target = "signaling.session", peer = %self.peer, "data channel closed");
                    self.ctx.channels.unregister(&self.peer, &channel);
                }
                Flow::Continue
            }
        }
    }

    async fn start(&mut self, role: Role) -> Result<(), SessionError> {
        if self.state != SessionState::New {
            return Err(SessionError::InvalidState {
                peer: self.peer.clone(),
                action: "start negotiating",
                state: self.state.as_str(),
            });
        }
        self.role = Some(role);
        self.transition(SessionState::Negotiating);
        let events = TransportEvents::new(self.generation, self.inbox.clone());
        match self.ctx.factory.create(&self.peer, events).await {
            Ok(transport) => {
                self.worker = Some(NegotiationWorker::spawn(
                    self.peer.clone(),
                    self.generation,
                    transport.clone(),
                    self.inbox.clone(),
                ));
                self.transport = Some(transport);
                Ok(())
            }
            Err(source) => {
                let err = SessionError::TransportSetupFailed {
                    peer: self.peer.clone(),
                    source,
                };
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    fn accept_offer(&mut self, sdp: String) {
        self.remote_offer = Some(sdp.clone());
        self.submit(TransportOp::AcceptOffer(sdp));
    }

    fn ready_for_candidates(&self) -> bool {
        self.local_described && self.remote_described && self.worker.is_some()
    }

    fn flush_candidates(&mut self) {
        if !self.ready_for_candidates() {
            return;
        }
        if !self.pending_remote.is_empty() {
            debug!(target = "signaling.session", peer = %self.peer, count = self.pending_remote.len(), "applying buffered candidates");
        }
        while let Some(candidate) = self.pending_remote.pop_front() {
            self.submit(TransportOp::AddCandidate(candidate));
        }
    }

    fn submit(&mut self, op: TransportOp) {
        let accepted = self.worker.as_ref().is_some_and(|worker| worker.submit(op));
        if !accepted {
            warn!(target = "signaling.session", peer = %self.peer, "transport worker unavailable; op dropped");
        }
    }

    /// Publishes an offer or answer, then any candidates gathered meanwhile.
    fn publish_description(&mut self, kind: MessageKind, sdp: String) -> Result<(), SessionError> {
        self.publish(kind, sdp)?;
        for line in std::mem::take(&mut self.pending_local) {
            self.publish(MessageKind::Ice, line)?;
        }
        Ok(())
    }

    fn publish(&mut self, kind: MessageKind, payload: String) -> Result<(), SessionError> {
        self.ctx
            .publisher
            .publish(&OutboundEnvelope::new(self.peer.clone(), kind, payload))
    }

    async fn fail(&mut self, reason: SessionError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(target = "signaling.session", peer = %self.peer, generation = self.generation, error = %reason, "session failed");
        self.transition(SessionState::Failed);
        let failures = self.release().await;
        if !failures.is_empty() {
            warn!(target = "signaling.session", peer = %self.peer, failures = ?failures, "release after failure incomplete");
        }
        self.notify(SessionEvent::Disconnected {
            peer: self.peer.clone(),
            reason: Some(reason.to_string()),
        });
    }

    async fn release(&mut self) -> Vec<String> {
        // dropping the worker cancels in-flight negotiation
        self.worker = None;
        self.pending_remote.clear();
        self.pending_local.clear();
        let mut failures = Vec::new();
        if let Some(channel) = self.channel.take() {
            self.ctx.channels.unregister(&self.peer, &channel);
            if let Err(err) = channel.close().await {
                failures.push(format!("channel: {err}"));
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                failures.push(format!("transport: {err}"));
            }
        }
        failures
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(target = "signaling.session", peer = %self.peer, generation = self.generation, from = %self.state, to = %next, "transition");
        self.state = next;
        metrics::SESSION_TRANSITIONS
            .with_label_values(&[next.as_str()])
            .inc();
        self.notify(SessionEvent::StateChanged {
            peer: self.peer.clone(),
            generation: self.generation,
            state: next,
        });
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        metrics::SESSIONS_ACTIVE.dec();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("pending_candidates", &self.pending_remote.len())
            .finish()
    }
}
