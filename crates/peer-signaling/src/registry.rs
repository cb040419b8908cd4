//! Identity-keyed ownership of peer sessions.
//!
//! Every identity gets a slot: a per-peer async lock around its session and
//! an inbox drained by one dispatcher task. Creation, dispatch and teardown
//! for an identity all run under that slot lock, so they are mutually
//! exclusive, while distinct identities proceed in parallel. The map of
//! slots has its own short-lived lock that is only taken for structural
//! changes and lookups, never across an await.
//!
//! A slot that ends up holding nothing useful (no session, a finished one,
//! or one still in `New`) is retired once the idle expiry passes.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::channel::DataChannelManager;
use crate::error::SessionError;
use crate::identity::PeerId;
use crate::outbound::SignalPublisher;
use crate::router::SignalingEvent;
use crate::session::{
    Flow, HelloResponse, PeerSession, SessionContext, SessionEvent, SessionInput, SessionSnapshot,
    SessionState,
};
use crate::transport::TransportFactory;

const EVENT_CAPACITY: usize = 256;
pub const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct SlotState {
    session: Option<PeerSession>,
    retired: bool,
}

struct PeerSlot {
    state: Arc<Mutex<SlotState>>,
    inbox: mpsc::UnboundedSender<SessionInput>,
    retired: Notify,
}

type SlotGuard = OwnedMutexGuard<SlotState>;

/// Exclusive access to one peer's session; the peer stays locked until
/// the guard is dropped.
pub struct SessionGuard(OwnedMappedMutexGuard<SlotState, PeerSession>);

impl Deref for SessionGuard {
    type Target = PeerSession;

    fn deref(&self) -> &PeerSession {
        &self.0
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut PeerSession {
        &mut self.0
    }
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub closed: usize,
    pub failures: Vec<(PeerId, SessionError)>,
}

struct RegistryInner {
    slots: parking_lot::Mutex<HashMap<PeerId, Arc<PeerSlot>>>,
    ctx: Arc<SessionContext>,
    generations: AtomicU64,
    shutting_down: AtomicBool,
    idle_expiry_ms: AtomicU64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        publisher: SignalPublisher,
        factory: Arc<dyn TransportFactory>,
        channels: DataChannelManager,
        hello_response: HelloResponse,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ctx = SessionContext {
            publisher,
            factory,
            channels,
            events,
            hello_response,
        };
        Self {
            inner: Arc::new(RegistryInner {
                slots: parking_lot::Mutex::new(HashMap::new()),
                ctx: Arc::new(ctx),
                generations: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                idle_expiry_ms: AtomicU64::new(DEFAULT_IDLE_EXPIRY.as_millis() as u64),
            }),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        self.inner.ctx.publisher.self_id()
    }

    pub fn channels(&self) -> &DataChannelManager {
        &self.inner.ctx.channels
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// How long a slot may sit without a running session before it is
    /// retired.
    pub fn set_idle_expiry(&self, expiry: Duration) {
        self.inner
            .idle_expiry_ms
            .store(expiry.as_millis() as u64, Ordering::Relaxed);
    }

    /// Identities that currently own a slot.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.slots.lock().keys().cloned().collect()
    }

    /// Existing live session for `peer`, or a fresh one in `New`.
    pub async fn get_or_create(&self, peer: &PeerId) -> Result<SessionGuard, SessionError> {
        let (slot, mut guard) = self.inner.lock_slot(peer).await?;
        if guard
            .session
            .as_ref()
            .is_some_and(|session| session.state().is_terminal())
        {
            guard.session = None;
        }
        let guard = self.inner.guard(peer, &slot, guard);
        self.inner.schedule_expiry(peer, &slot, guard.generation());
        Ok(guard)
    }

    /// Tears down any session for `peer` and hands back a fresh one. The
    /// old transport and channel are released before this returns.
    pub async fn replace(&self, peer: &PeerId) -> Result<SessionGuard, SessionError> {
        let (slot, mut guard) = self.inner.lock_slot(peer).await?;
        self.inner.discard(peer, &mut guard).await;
        let guard = self.inner.guard(peer, &slot, guard);
        self.inner.schedule_expiry(peer, &slot, guard.generation());
        Ok(guard)
    }

    /// Tears down and forgets the session for `peer`. Absent peers are a no-op.
    pub async fn remove(&self, peer: &PeerId) -> Result<(), SessionError> {
        self.inner.remove(peer).await.unwrap_or(Ok(()))
    }

    /// Best-effort teardown of every session; individual failures are
    /// collected, never raised. The registry refuses new sessions from
    /// here on, including signals still queued for a torn-down peer.
    pub async fn teardown_all(&self) -> TeardownReport {
        let peers: Vec<PeerId> = {
            let slots = self.inner.slots.lock();
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            slots.keys().cloned().collect()
        };
        let results = join_all(peers.iter().map(|peer| self.inner.remove(peer))).await;
        let mut report = TeardownReport::default();
        for (peer, result) in peers.into_iter().zip(results) {
            match result {
                Some(Ok(())) => report.closed += 1,
                Some(Err(err)) => {
                    report.closed += 1;
                    report.failures.push((peer, err));
                }
                None => {}
            }
        }
        info!(target = "signaling.registry", closed = report.closed, failures = report.failures.len(), "all sessions torn down");
        report
    }

    /// Locally initiated call. A session past `New` is replaced first.
    pub async fn initiate(&self, peer: &PeerId) -> Result<(), SessionError> {
        let (slot, mut guard) = self.inner.lock_slot(peer).await?;
        if guard
            .session
            .as_ref()
            .is_some_and(|session| session.state() != SessionState::New)
        {
            self.inner.discard(peer, &mut guard).await;
        }
        let session = self.inner.session_mut(peer, &slot, &mut guard);
        if let Err(err) = session.initiate().await {
            guard.session = None;
            self.inner.retire(peer, &slot, &mut guard);
            return Err(err);
        }
        Ok(())
    }

    /// Says hello to `peer` and waits for it to offer.
    pub async fn announce(&self, peer: &PeerId) -> Result<(), SessionError> {
        let (slot, mut guard) = self.inner.lock_slot(peer).await?;
        self.inner.discard(peer, &mut guard).await;
        let session = self.inner.session_mut(peer, &slot, &mut guard);
        let prepared = match session.await_offer().await {
            Ok(()) => session.publish_hello(),
            Err(err) => Err(err),
        };
        if let Err(err) = prepared {
            self.inner.discard(peer, &mut guard).await;
            self.inner.retire(peer, &slot, &mut guard);
            return Err(err);
        }
        Ok(())
    }

    pub async fn snapshot(&self, peer: &PeerId) -> Option<SessionSnapshot> {
        let (_, guard) = self.inner.lock_existing(peer).await?;
        guard.session.as_ref().map(PeerSession::snapshot)
    }

    /// Queues a routed event on its peer's inbox without waiting.
    pub fn dispatch(&self, event: SignalingEvent) {
        self.inner.dispatch(event);
    }

    /// Feeds a raw input to an existing peer slot.
    #[cfg(test)]
    pub(crate) fn deliver(&self, peer: &PeerId, input: SessionInput) -> bool {
        let slots = self.inner.slots.lock();
        slots
            .get(peer)
            .is_some_and(|slot| slot.inbox.send(input).is_ok())
    }
}

impl RegistryInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn new_session(&self, peer: &PeerId, slot: &PeerSlot) -> PeerSession {
        PeerSession::new(
            peer.clone(),
            self.next_generation(),
            self.ctx.clone(),
            slot.inbox.clone(),
        )
    }

    fn session_mut<'a>(
        &self,
        peer: &PeerId,
        slot: &PeerSlot,
        guard: &'a mut SlotGuard,
    ) -> &'a mut PeerSession {
        guard
            .session
            .get_or_insert_with(|| self.new_session(peer, slot))
    }

    fn guard(&self, peer: &PeerId, slot: &PeerSlot, guard: SlotGuard) -> SessionGuard {
        SessionGuard(OwnedMutexGuard::map(guard, |state| {
            state
                .session
                .get_or_insert_with(|| self.new_session(peer, slot))
        }))
    }

    fn spawn_slot(self: &Arc<Self>, peer: &PeerId) -> Arc<PeerSlot> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(PeerSlot {
            state: Arc::new(Mutex::new(SlotState::default())),
            inbox,
            retired: Notify::new(),
        });
        tokio::spawn(run_dispatcher(
            Arc::downgrade(self),
            peer.clone(),
            slot.clone(),
            rx,
        ));
        slot
    }

    async fn lock_slot(
        self: &Arc<Self>,
        peer: &PeerId,
    ) -> Result<(Arc<PeerSlot>, SlotGuard), SessionError> {
        loop {
            let slot = {
                let mut slots = self.slots.lock();
                if self.shutting_down.load(Ordering::SeqCst) {
                    return Err(SessionError::ShuttingDown { peer: peer.clone() });
                }
                match slots.get(peer) {
                    Some(slot) => slot.clone(),
                    None => {
                        let slot = self.spawn_slot(peer);
                        slots.insert(peer.clone(), slot.clone());
                        slot
                    }
                }
            };
            let guard = slot.state.clone().lock_owned().await;
            if !guard.retired {
                return Ok((slot, guard));
            }
        }
    }

    async fn lock_existing(&self, peer: &PeerId) -> Option<(Arc<PeerSlot>, SlotGuard)> {
        loop {
            let slot = self.slots.lock().get(peer).cloned()?;
            let guard = slot.state.clone().lock_owned().await;
            if !guard.retired {
                return Some((slot, guard));
            }
        }
    }

    /// Closes and drops whatever session the slot holds.
    async fn discard(&self, peer: &PeerId, state: &mut SlotState) {
        if let Some(mut old) = state.session.take() {
            debug!(target = "signaling.registry", peer = %peer, generation = old.generation(), "discarding session");
            if let Err(err) = old.close().await {
                warn!(target = "signaling.registry", peer = %peer, error = %err, "previous session released with errors");
            }
        }
    }

    async fn remove(&self, peer: &PeerId) -> Option<Result<(), SessionError>> {
        let (slot, mut guard) = self.lock_existing(peer).await?;
        let result = match guard.session.take() {
            Some(mut session) => session.close().await,
            None => Ok(()),
        };
        self.retire(peer, &slot, &mut guard);
        debug!(target = "signaling.registry", peer = %peer, "session removed");
        Some(result)
    }

    fn schedule_expiry(self: &Arc<Self>, peer: &PeerId, slot: &Arc<PeerSlot>, generation: u64) {
        let expiry = Duration::from_millis(self.idle_expiry_ms.load(Ordering::Relaxed));
        let registry = Arc::downgrade(self);
        let slot = Arc::downgrade(slot);
        let peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let (Some(inner), Some(slot)) = (registry.upgrade(), slot.upgrade()) {
                inner.expire_idle(&peer, &slot, generation).await;
            }
        });
    }

    /// Retires the slot unless its session got going since `generation`
    /// was handed out.
    async fn expire_idle(&self, peer: &PeerId, slot: &Arc<PeerSlot>, generation: u64) {
        let mut state = slot.state.lock().await;
        if state.retired {
            return;
        }
        let idle = match &state.session {
            None => true,
            Some(session) => {
                session.state().is_terminal()
                    || (session.state() == SessionState::New && session.generation() == generation)
            }
        };
        if !idle {
            return;
        }
        debug!(target = "signaling.registry", peer = %peer, generation, "idle slot expired");
        self.discard(peer, &mut state).await;
        self.retire(peer, slot, &mut state);
    }

    /// Marks the slot dead and unlinks it from the map. Must be called with
    /// the slot lock held so no one else observes a half-retired slot.
    fn retire(&self, peer: &PeerId, slot: &Arc<PeerSlot>, state: &mut SlotState) {
        state.retired = true;
        {
            let mut slots = self.slots.lock();
            if slots
                .get(peer)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                slots.remove(peer);
            }
        }
        slot.retired.notify_one();
    }

    fn dispatch(self: &Arc<Self>, event: SignalingEvent) {
        let peer = event.from().clone();
        let mut slots = self.slots.lock();
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(target = "signaling.registry", peer = %peer, kind = %event.kind(), "registry shutting down; event dropped");
            return;
        }
        if let Some(slot) = slots.get(&peer) {
            if slot.inbox.send(SessionInput::Signal(event)).is_err() {
                warn!(target = "signaling.registry", peer = %peer, "peer inbox closed; event dropped");
            }
            return;
        }
        if !event.creates_slot() {
            debug!(target = "signaling.registry", peer = %peer, kind = %event.kind(), "no session for peer; event dropped");
            return;
        }
        let slot = self.spawn_slot(&peer);
        slots.insert(peer, slot.clone());
        let _ = slot.inbox.send(SessionInput::Signal(event));
    }

    async fn handle(
        self: &Arc<Self>,
        peer: &PeerId,
        slot: &Arc<PeerSlot>,
        state: &mut SlotState,
        input: SessionInput,
    ) {
        let mut input = input;
        loop {
            let live = state
                .session
                .as_ref()
                .is_some_and(|session| !session.state().is_terminal());
            if !live {
                match &input {
                    SessionInput::Signal(event) if event.creates_slot() => {
                        let session = self.new_session(peer, slot);
                        if !event.opens_session() {
                            // parked candidates wait for an offer that may never come
                            self.schedule_expiry(peer, slot, session.generation());
                        }
                        state.session = Some(session);
                    }
                    SessionInput::Signal(event) => {
                        debug!(target = "signaling.registry", peer = %peer, kind = %event.kind(), "no live session; event dropped");
                        return;
                    }
                    _ => {
                        debug!(target = "signaling.registry", peer = %peer, "input for retired session dropped");
                        return;
                    }
                }
            }
            let Some(session) = state.session.as_mut() else {
                return;
            };
            match session.handle(input).await {
                Flow::Continue => return,
                Flow::Connected => {
                    if let Err(err) = self.ctx.channels.open(session) {
                        warn!(target = "signaling.registry", peer = %peer, error = %err, "could not open data channel");
                    }
                    return;
                }
                Flow::Ended => {
                    state.session = None;
                    self.retire(peer, slot, state);
                    return;
                }
                Flow::Replace(event) => {
                    info!(target = "signaling.registry", peer = %peer, kind = %event.kind(), "peer restarted; replacing session");
                    self.discard(peer, state).await;
                    state.session = Some(self.new_session(peer, slot));
                    input = SessionInput::Signal(event);
                }
            }
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            slot.retired.notify_one();
        }
    }
}

async fn run_dispatcher(
    registry: Weak<RegistryInner>,
    peer: PeerId,
    slot: Arc<PeerSlot>,
    mut rx: mpsc::UnboundedReceiver<SessionInput>,
) {
    let mut leftover = None;
    loop {
        let input = tokio::select! {
            input = rx.recv() => match input {
                Some(input) => input,
                None => break,
            },
            _ = slot.retired.notified() => break,
        };
        let Some(inner) = registry.upgrade() else {
            break;
        };
        let mut state = slot.state.clone().lock_owned().await;
        if state.retired {
            leftover = Some(input);
            break;
        }
        inner.handle(&peer, &slot, &mut state, input).await;
        if state.retired {
            break;
        }
    }
    // Signals that raced with retirement go to the identity's next slot.
    rx.close();
    let registry = registry.upgrade();
    let pending = leftover.into_iter().chain(std::iter::from_fn(|| rx.try_recv().ok()));
    for input in pending {
        if let (Some(inner), SessionInput::Signal(event)) = (&registry, input) {
            inner.dispatch(event);
        }
    }
    debug!(target = "signaling.registry", peer = %peer, "dispatcher stopped");
}
