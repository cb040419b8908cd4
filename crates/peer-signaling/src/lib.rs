//! Peer-to-peer signaling over a pub/sub bus.
//!
//! Offers, answers and ICE candidates travel as bus messages under
//! `<ns>/<peer>/...` topics. [`SignalingEngine`] decodes them with a
//! [`TopicRouter`] and drives one [`PeerSession`] per remote identity
//! through the [`SessionRegistry`]; once a session is connected its data
//! channel carries detection payloads via the [`DataChannelManager`].

pub mod candidate;
pub mod channel;
pub mod config;
pub mod detection;
pub mod engine;
pub mod error;
pub mod identity;
pub mod lost_items;
pub mod metrics;
mod negotiation;
pub mod outbound;
pub mod registry;
pub mod router;
pub mod session;
pub mod shared;
pub mod telemetry;
pub mod transport;

pub use candidate::IceCandidate;
pub use channel::{BroadcastReport, DataChannelManager};
pub use config::SignalingConfig;
pub use detection::{DetectionFrame, DetectionPipeline, LabelFilter};
pub use engine::SignalingEngine;
pub use error::{
    ChannelError, ConfigError, EngineError, IdentityError, InvalidCandidate, RouteError,
    SessionError, TransportError,
};
pub use identity::PeerId;
pub use lost_items::{lost_items, DiffPolicy, LostItemAlert, OccupancyMonitor};
pub use negotiation::NegotiationStep;
pub use outbound::{OutboundEnvelope, SignalPublisher};
pub use registry::{SessionGuard, SessionRegistry, TeardownReport};
pub use router::{MessageKind, SignalingEvent, TopicRouter};
pub use session::{HelloResponse, PeerSession, Role, SessionEvent, SessionState};
pub use shared::{Holder, SharedResource};
