//! Deterministic in-memory backend.
//!
//! Negotiation always succeeds unless told otherwise, reaches `Connected`
//! as soon as both descriptions are installed, and records every side
//! effect in a shared [`MockLedger`] for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DataChannel, LinkState, PeerTransport, SdpKind, TransportEvent, TransportEvents, TransportFactory};
use crate::candidate::IceCandidate;
use crate::error::TransportError;
use crate::identity::PeerId;

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    pub fail_setup_for: HashSet<PeerId>,
    pub fail_offer: bool,
    pub op_latency: Option<Duration>,
    pub manual_connect: bool,
    pub fail_channel_close: bool,
    pub fail_transport_close: bool,
    /// Track ids attached to every transport at creation.
    pub local_tracks: Vec<String>,
}

#[derive(Default)]
struct LedgerState {
    created: usize,
    live: usize,
    max_live: usize,
    log: Vec<String>,
    candidates: HashMap<PeerId, Vec<String>>,
    sent: HashMap<PeerId, Vec<String>>,
    events: HashMap<PeerId, TransportEvents>,
}

/// Shared record of what the mock backend was asked to do.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn applied_candidates(&self, peer: &PeerId) -> Vec<String> {
        self.state
            .lock()
            .candidates
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sent_messages(&self, peer: &PeerId) -> Vec<String> {
        self.state.lock().sent.get(peer).cloned().unwrap_or_default()
    }

    /// Pushes a backend event into the newest transport created for `peer`.
    pub fn inject(&self, peer: &PeerId, event: TransportEvent) -> bool {
        let events = self.state.lock().events.get(peer).cloned();
        match events {
            Some(events) => {
                events.emit(event);
                true
            }
            None => false,
        }
    }

    fn record(&self, entry: String) {
        self.state.lock().log.push(entry);
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    options: MockOptions,
    ledger: Arc<MockLedger>,
    sequence: AtomicU64,
}

impl MockTransportFactory {
    pub fn new(options: MockOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn ledger(&self) -> Arc<MockLedger> {
        self.ledger.clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.options.fail_setup_for.contains(peer) {
            self.ledger.record(format!("setup-failed:{peer}"));
            return Err(TransportError::Setup(format!("mock refuses {peer}")));
        }
        let serial = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut state = self.ledger.state.lock();
            state.created += 1;
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
            state.log.push(format!("transport-open:{peer}"));
            for track in &self.options.local_tracks {
                state.log.push(format!("track-add:{peer}:{track}"));
            }
            state.events.insert(peer.clone(), events.clone());
        }
        Ok(Arc::new(MockTransport {
            peer: peer.clone(),
            serial,
            events,
            options: self.options.clone(),
            ledger: self.ledger.clone(),
            descriptions: Mutex::new(Descriptions::default()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
struct Descriptions {
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
}

pub struct MockTransport {
    peer: PeerId,
    serial: u64,
    events: TransportEvents,
    options: MockOptions,
    ledger: Arc<MockLedger>,
    descriptions: Mutex<Descriptions>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    async fn pause(&self) -> Result<(), TransportError> {
        if let Some(latency) = self.options.op_latency {
            tokio::time::sleep(latency).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn local_candidate(&self) -> String {
        format!(
            "candidate:{} 1 udp 2122260223 10.0.{}.{} 50000 typ host",
            self.serial,
            self.serial % 250,
            self.peer.as_str().len() % 250 + 1
        )
    }

    fn maybe_connect(&self) {
        if self.options.manual_connect {
            return;
        }
        let ready = {
            let descriptions = self.descriptions.lock();
            descriptions.local.is_some() && descriptions.remote.is_some()
        };
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            self.events.emit(TransportEvent::Link(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.pause().await?;
        if self.options.fail_offer {
            return Err(TransportError::Description("mock offer failure".into()));
        }
        self.descriptions.lock().local = Some(SdpKind::Offer);
        self.ledger.record(format!("offer:{}", self.peer));
        self.events
            .emit(TransportEvent::LocalCandidate(self.local_candidate()));
        Ok(format!("v=0\r\no=mock {} 1 IN IP4 0.0.0.0\r\ns=offer\r\n", self.serial))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.pause().await?;
        {
            let mut descriptions = self.descriptions.lock();
            if descriptions.remote != Some(SdpKind::Offer) {
                return Err(TransportError::Description("no remote offer installed".into()));
            }
            descriptions.local = Some(SdpKind::Answer);
        }
        self.ledger.record(format!("answer:{}", self.peer));
        self.events
            .emit(TransportEvent::LocalCandidate(self.local_candidate()));
        self.maybe_connect();
        Ok(format!("v=0\r\no=mock {} 1 IN IP4 0.0.0.0\r\ns=answer\r\n", self.serial))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        self.pause().await?;
        if !sdp.starts_with("v=0") {
            return Err(TransportError::Description("not an SDP body".into()));
        }
        {
            let mut descriptions = self.descriptions.lock();
            let acceptable = match kind {
                SdpKind::Offer => descriptions.local.is_none(),
                SdpKind::Answer => descriptions.local == Some(SdpKind::Offer),
            };
            if !acceptable || descriptions.remote.is_some() {
                return Err(TransportError::Description(format!(
                    "unexpected remote {kind:?}"
                )));
            }
            descriptions.remote = Some(kind);
        }
        let entry = match kind {
            SdpKind::Offer => "remote-offer",
            SdpKind::Answer => "remote-answer",
        };
        self.ledger.record(format!("{entry}:{}", self.peer));
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pause().await?;
        {
            let descriptions = self.descriptions.lock();
            if descriptions.local.is_none() || descriptions.remote.is_none() {
                return Err(TransportError::Candidate("descriptions not installed".into()));
            }
        }
        self.ledger
            .state
            .lock()
            .candidates
            .entry(self.peer.clone())
            .or_default()
            .push(candidate.as_str().to_string());
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.pause().await?;
        self.ledger.record(format!("channel-open:{}", self.peer));
        Ok(Arc::new(MockDataChannel {
            peer: self.peer.clone(),
            label: label.to_string(),
            open: AtomicBool::new(true),
            fail_close: self.options.fail_channel_close,
            events: self.events.clone(),
            ledger: self.ledger.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.ledger.state.lock();
            state.live = state.live.saturating_sub(1);
            state.log.push(format!("transport-close:{}", self.peer));
        }
        if self.options.fail_transport_close {
            return Err(TransportError::Other("mock close failure".into()));
        }
        Ok(())
    }
}

pub struct MockDataChannel {
    peer: PeerId,
    label: String,
    open: AtomicBool,
    fail_close: bool,
    events: TransportEvents,
    ledger: Arc<MockLedger>,
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, payload: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Channel("closed".into()));
        }
        self.ledger
            .state
            .lock()
            .sent
            .entry(self.peer.clone())
            .or_default()
            .push(payload.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.ledger.record(format!("channel-close:{}", self.peer));
            self.events.emit(TransportEvent::ChannelClosed);
        }
        if self.fail_close {
            return Err(TransportError::Channel("mock channel close failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::SessionInput;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).expect("id")
    }

    #[tokio::test]
    async fn offer_answer_pair_reports_connected() {
        let factory = MockTransportFactory::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&peer("viewer"), TransportEvents::new(3, tx))
            .await
            .expect("create");

        let offer = transport.create_offer().await.expect("offer");
        transport
            .set_remote_description(SdpKind::Answer, &offer.replace("offer", "answer"))
            .await
            .expect("answer");

        let mut saw_connected = false;
        while let Ok(input) = rx.try_recv() {
            if let SessionInput::Transport { generation, event } = input {
                assert_eq!(generation, 3);
                saw_connected |= event == TransportEvent::Link(LinkState::Connected);
            }
        }
        assert!(saw_connected);
        assert_eq!(factory.ledger().live(), 1);
        transport.close().await.expect("close");
        transport.close().await.expect("close twice");
        assert_eq!(factory.ledger().live(), 0);
    }

    #[tokio::test]
    async fn candidates_need_both_descriptions() {
        let factory = MockTransportFactory::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&peer("viewer"), TransportEvents::new(1, tx))
            .await
            .expect("create");
        let cand = IceCandidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ host").expect("cand");
        assert!(transport.add_ice_candidate(&cand).await.is_err());
    }
}
