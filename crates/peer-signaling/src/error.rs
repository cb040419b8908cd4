use thiserror::Error;

use crate::identity::PeerId;
use crate::negotiation::NegotiationStep;

/// Inbound decode failures. All are non-fatal: the message is logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("malformed topic {topic}: {reason}")]
    MalformedTopic { topic: String, reason: &'static str },
    #[error("unknown message kind '{kind}' on {topic}")]
    UnknownMessageKind { topic: String, kind: String },
    #[error("topic {topic} is addressed to {addressee}")]
    Misaddressed { topic: String, addressee: String },
    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
}

impl RouteError {
    pub fn reason_label(&self) -> &'static str {
        match self {
            RouteError::MalformedTopic { .. } => "malformed_topic",
            RouteError::UnknownMessageKind { .. } => "unknown_kind",
            RouteError::Misaddressed { .. } => "misaddressed",
            RouteError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid peer identity '{raw}': {reason}")]
pub struct IdentityError {
    pub raw: String,
    pub reason: &'static str,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid ICE candidate '{raw}': {reason}")]
pub struct InvalidCandidate {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("session description error: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("transport setup failed for {peer}: {source}")]
    TransportSetupFailed { peer: PeerId, source: TransportError },
    #[error("negotiation with {peer} failed at {step}: {source}")]
    NegotiationFailed {
        peer: PeerId,
        step: NegotiationStep,
        source: TransportError,
    },
    #[error("publishing {kind} to {peer} failed: {reason}")]
    PublishFailed {
        peer: PeerId,
        kind: &'static str,
        reason: String,
    },
    #[error("transport for {peer} reported {state}")]
    TransportLost { peer: PeerId, state: &'static str },
    #[error("session for {peer} cannot {action} while {state}")]
    InvalidState {
        peer: PeerId,
        action: &'static str,
        state: &'static str,
    },
    #[error("releasing session for {peer} failed: {}", .failures.join("; "))]
    Release { peer: PeerId, failures: Vec<String> },
    #[error("registry is shutting down; no session for {peer}")]
    ShuttingDown { peer: PeerId },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("data channel for {0} is not open")]
    ChannelNotReady(PeerId),
    #[error("session for {peer} is {state}, channels open only once connected")]
    NotConnected { peer: PeerId, state: &'static str },
    #[error("sending to {peer} failed: {source}")]
    Send { peer: PeerId, source: TransportError },
    #[error("closing channel for {peer} failed: {source}")]
    Close { peer: PeerId, source: TransportError },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Bus(#[from] transport_bus::BusError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
