use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ChannelError;
use crate::identity::PeerId;
use crate::metrics;
use crate::session::{PeerSession, SessionInput};
use crate::transport::DataChannel;

pub const DEFAULT_CHANNEL_LABEL: &str = "detections";

/// Outcome of a best-effort [`DataChannelManager::broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    pub skipped: Vec<(PeerId, ChannelError)>,
}

struct ChannelEntry {
    channel: Weak<dyn DataChannel>,
    owner: mpsc::UnboundedSender<SessionInput>,
}

/// Per-peer outbound channels.
///
/// The owning [`PeerSession`] holds the only strong reference to a channel;
/// the manager keeps weak handles, so a torn-down session can never leave
/// a sendable channel behind. Anything that changes a channel goes back
/// through the owner's inbox.
#[derive(Clone)]
pub struct DataChannelManager {
    label: Arc<str>,
    channels: Arc<RwLock<HashMap<PeerId, ChannelEntry>>>,
}

impl DataChannelManager {
    pub fn new(label: impl AsRef<str>) -> Self {
        Self {
            label: Arc::from(label.as_ref()),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Asks a connected session for its ordered, reliable channel. The
    /// channel becomes sendable once the transport reports it open.
    pub fn open(&self, session: &mut PeerSession) -> Result<(), ChannelError> {
        session.request_channel(&self.label)
    }

    pub(crate) fn register(
        &self,
        peer: &PeerId,
        channel: &Arc<dyn DataChannel>,
        owner: &mpsc::UnboundedSender<SessionInput>,
    ) {
        self.channels.write().insert(
            peer.clone(),
            ChannelEntry {
                channel: Arc::downgrade(channel),
                owner: owner.clone(),
            },
        );
    }

    pub(crate) fn unregister(&self, peer: &PeerId, channel: &Arc<dyn DataChannel>) {
        let mut guard = self.channels.write();
        let current = guard
            .get(peer)
            .is_some_and(|entry| entry.channel.ptr_eq(&Arc::downgrade(channel)));
        if current {
            guard.remove(peer);
        }
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<dyn DataChannel>> {
        self.channels
            .read()
            .get(peer)
            .and_then(|entry| entry.channel.upgrade())
    }

    pub fn is_ready(&self, peer: &PeerId) -> bool {
        self.lookup(peer).is_some_and(|channel| channel.is_open())
    }

    /// Peers whose channel is currently open.
    pub fn ready_peers(&self) -> Vec<PeerId> {
        let guard = self.channels.read();
        guard
            .iter()
            .filter(|(_, entry)| entry.channel.upgrade().is_some_and(|c| c.is_open()))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Delivers `payload` only if the peer's channel is open right now.
    /// Nothing is queued; a closed or missing channel is `ChannelNotReady`.
    pub async fn send(&self, peer: &PeerId, payload: &str) -> Result<(), ChannelError> {
        let Some(channel) = self.lookup(peer).filter(|channel| channel.is_open()) else {
            metrics::CHANNEL_SENDS.with_label_values(&["not_ready"]).inc();
            return Err(ChannelError::ChannelNotReady(peer.clone()));
        };
        match channel.send_text(payload).await {
            Ok(()) => {
                metrics::CHANNEL_SENDS.with_label_values(&["sent"]).inc();
                Ok(())
            }
            Err(source) => {
                metrics::CHANNEL_SENDS.with_label_values(&["error"]).inc();
                Err(ChannelError::Send {
                    peer: peer.clone(),
                    source,
                })
            }
        }
    }

    pub async fn broadcast(&self, payload: &str) -> BroadcastReport {
        let peers: Vec<PeerId> = self.channels.read().keys().cloned().collect();
        let mut report = BroadcastReport::default();
        for peer in peers {
            match self.send(&peer, payload).await {
                Ok(()) => report.delivered.push(peer),
                Err(err) => {
                    debug!(target = "signaling.channel", peer = %peer, error = %err, "broadcast skipped peer");
                    report.skipped.push((peer, err));
                }
            }
        }
        report
    }

    /// Has the owning session close the peer's channel and waits for it;
    /// the channel may be opened again afterwards. Calling it again, or for
    /// a peer without a channel, is a no-op. Never await this from inside
    /// the same peer's session.
    pub async fn close(&self, peer: &PeerId) -> Result<(), ChannelError> {
        let owner = self
            .channels
            .read()
            .get(peer)
            .map(|entry| entry.owner.clone());
        let Some(owner) = owner else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        if owner.send(SessionInput::CloseChannel(reply)).is_err() {
            return Ok(());
        }
        // a session that ends first drops the reply; its channel is gone too
        done.await.unwrap_or(Ok(()))
    }
}

impl Default for DataChannelManager {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_LABEL)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransportError;

    struct FlagChannel {
        open: AtomicBool,
        sent: parking_lot::Mutex<Vec<String>>,
    }

    impl FlagChannel {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(open),
                sent: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DataChannel for FlagChannel {
        fn label(&self) -> &str {
            DEFAULT_CHANNEL_LABEL
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, payload: &str) -> Result<(), TransportError> {
            self.sent.lock().push(payload.to_string());
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).expect("id")
    }

    fn owner() -> mpsc::UnboundedSender<SessionInput> {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let manager = DataChannelManager::default();
        let viewer = peer("viewer");
        assert_eq!(
            manager.send(&viewer, "cup/").await,
            Err(ChannelError::ChannelNotReady(viewer.clone()))
        );

        let flag = FlagChannel::new(false);
        let channel: Arc<dyn DataChannel> = flag.clone();
        manager.register(&viewer, &channel, &owner());
        assert_eq!(
            manager.send(&viewer, "cup/").await,
            Err(ChannelError::ChannelNotReady(viewer.clone()))
        );

        flag.open.store(true, Ordering::SeqCst);
        manager.send(&viewer, "cup/").await.expect("sent");
        assert_eq!(flag.sent.lock().as_slice(), ["cup/".to_string()]);
    }

    #[tokio::test]
    async fn dropped_owner_makes_channel_unreachable() {
        let manager = DataChannelManager::default();
        let viewer = peer("viewer");
        let channel: Arc<dyn DataChannel> = FlagChannel::new(true);
        manager.register(&viewer, &channel, &owner());
        assert!(manager.is_ready(&viewer));
        drop(channel);
        assert!(!manager.is_ready(&viewer));
        assert!(manager.ready_peers().is_empty());
    }

    #[tokio::test]
    async fn close_goes_through_owning_session() {
        let manager = DataChannelManager::default();
        let viewer = peer("viewer");
        manager.close(&viewer).await.expect("no channel");

        let channel: Arc<dyn DataChannel> = FlagChannel::new(true);
        let (inbox, mut rx) = mpsc::unbounded_channel();
        manager.register(&viewer, &channel, &inbox);

        let owner = {
            let manager = manager.clone();
            let viewer = viewer.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let Some(SessionInput::CloseChannel(reply)) = rx.recv().await else {
                    panic!("expected close request");
                };
                manager.unregister(&viewer, &channel);
                channel.close().await.expect("flag close");
                let _ = reply.send(Ok(()));
            })
        };
        manager.close(&viewer).await.expect("close");
        owner.await.expect("owner task");
        assert!(!channel.is_open());
        assert!(!manager.is_ready(&viewer));

        manager.close(&viewer).await.expect("close again");
    }

    #[tokio::test]
    async fn close_for_departed_owner_is_noop() {
        let manager = DataChannelManager::default();
        let viewer = peer("viewer");
        let channel: Arc<dyn DataChannel> = FlagChannel::new(true);
        manager.register(&viewer, &channel, &owner());
        manager.close(&viewer).await.expect("owner gone");
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn broadcast_reports_skipped_peers() {
        let manager = DataChannelManager::default();
        let open: Arc<dyn DataChannel> = FlagChannel::new(true);
        let shut: Arc<dyn DataChannel> = FlagChannel::new(false);
        manager.register(&peer("a"), &open, &owner());
        manager.register(&peer("b"), &shut, &owner());
        let report = manager.broadcast("person/").await;
        assert_eq!(report.delivered, vec![peer("a")]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, peer("b"));
    }

    #[test]
    fn unregister_ignores_replaced_channel() {
        let manager = DataChannelManager::default();
        let viewer = peer("viewer");
        let old: Arc<dyn DataChannel> = FlagChannel::new(true);
        let new: Arc<dyn DataChannel> = FlagChannel::new(true);
        manager.register(&viewer, &old, &owner());
        manager.register(&viewer, &new, &owner());
        manager.unregister(&viewer, &old);
        assert!(manager.is_ready(&viewer));
    }
}
