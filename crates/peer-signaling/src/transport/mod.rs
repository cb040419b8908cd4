//! Peer transport seam.
//!
//! A [`PeerTransport`] is one negotiated peer connection. Backends report
//! asynchronous happenings (local candidates, link state, channel traffic)
//! through [`TransportEvents`], which routes them back into the owning
//! session's serialized inbox.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::candidate::IceCandidate;
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::session::SessionInput;

pub mod mock;
#[cfg(feature = "rtc")]
pub mod rtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connectivity as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Locally gathered candidate line to trickle to the peer.
    LocalCandidate(String),
    Link(LinkState),
    ChannelMessage(String),
    ChannelClosed,
    /// The peer added a media track to the connection.
    RemoteTrack { id: String, kind: MediaKind },
}

/// Sink handed to a backend at construction.
///
/// Every event is stamped with the generation of the session that created
/// the transport, so events outliving their session are discarded.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl TransportEvents {
    pub fn new(generation: u64, inbox: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { generation, inbox }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        // inbox closes when the peer slot is retired; late events are moot then
        let _ = self.inbox.send(SessionInput::Transport {
            generation: self.generation,
            event,
        });
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send_text(&self, payload: &str) -> Result<(), TransportError>;
    /// Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, TransportError>;
    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> Result<String, TransportError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;
    async fn open_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a connection for `peer` with every configured local track
    /// already attached, so the first offer advertises them.
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
