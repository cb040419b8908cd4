//! Topic scheme decoding.
//!
//! Inbound traffic for a device arrives under `<ns>/<self>/#`:
//! * `<ns>/<self>/signal` carries the caller's identity and asks to start a session.
//! * `<ns>/<self>/<src>/{offer,answer,ice}` carries SDP text or a candidate line.

use std::fmt;

use crate::error::RouteError;
use crate::identity::PeerId;

pub const DEFAULT_NAMESPACE: &str = "webrtc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Offer,
    Answer,
    Ice,
}

impl MessageKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageKind::Hello => "signal",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Ice => "ice",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "signal" => Some(MessageKind::Hello),
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "ice" => Some(MessageKind::Ice),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A decoded signaling message, tagged with the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Hello { from: PeerId },
    Offer { from: PeerId, sdp: String },
    Answer { from: PeerId, sdp: String },
    IceCandidate { from: PeerId, candidate: String },
}

impl SignalingEvent {
    pub fn from(&self) -> &PeerId {
        match self {
            SignalingEvent::Hello { from }
            | SignalingEvent::Offer { from, .. }
            | SignalingEvent::Answer { from, .. }
            | SignalingEvent::IceCandidate { from, .. } => from,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingEvent::Hello { .. } => MessageKind::Hello,
            SignalingEvent::Offer { .. } => MessageKind::Offer,
            SignalingEvent::Answer { .. } => MessageKind::Answer,
            SignalingEvent::IceCandidate { .. } => MessageKind::Ice,
        }
    }

    /// Whether this event may bring a session into existence.
    pub fn opens_session(&self) -> bool {
        matches!(
            self,
            SignalingEvent::Hello { .. } | SignalingEvent::Offer { .. }
        )
    }

    /// Whether this event may claim a registry slot for an unknown peer.
    /// Candidates can outrun their offer on the bus, so they park in a fresh
    /// session; a stray answer never does.
    pub fn creates_slot(&self) -> bool {
        self.opens_session() || matches!(self, SignalingEvent::IceCandidate { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    namespace: String,
    self_id: PeerId,
}

impl TopicRouter {
    pub fn new(namespace: impl Into<String>, self_id: PeerId) -> Self {
        Self {
            namespace: namespace.into(),
            self_id,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn inbound_pattern(&self) -> String {
        format!("{}/{}/#", self.namespace, self.self_id)
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<SignalingEvent, RouteError> {
        let segments: Vec<&str> = topic.split('/').collect();
        if !(3..=4).contains(&segments.len()) {
            return Err(malformed(topic, "unexpected segment count"));
        }
        if segments[0] != self.namespace {
            return Err(malformed(topic, "namespace mismatch"));
        }
        let addressee =
            PeerId::new(segments[1]).map_err(|_| malformed(topic, "invalid addressee"))?;
        if addressee != self.self_id {
            return Err(RouteError::Misaddressed {
                topic: topic.to_string(),
                addressee: addressee.to_string(),
            });
        }

        let raw_kind = segments[segments.len() - 1];
        let kind = MessageKind::from_wire(raw_kind).ok_or_else(|| RouteError::UnknownMessageKind {
            topic: topic.to_string(),
            kind: raw_kind.to_string(),
        })?;
        let text = std::str::from_utf8(payload).map_err(|_| RouteError::InvalidPayload {
            topic: topic.to_string(),
            reason: "payload is not UTF-8".into(),
        })?;

        match (segments.len(), kind) {
            (3, MessageKind::Hello) => {
                let from = PeerId::new(text.trim()).map_err(|err| RouteError::InvalidPayload {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                })?;
                Ok(SignalingEvent::Hello { from })
            }
            (3, _) => Err(malformed(topic, "directed message without a source")),
            (_, MessageKind::Hello) => Err(malformed(topic, "signal carries no source level")),
            (_, kind) => {
                let from =
                    PeerId::new(segments[2]).map_err(|_| malformed(topic, "invalid source"))?;
                if text.trim().is_empty() {
                    return Err(RouteError::InvalidPayload {
                        topic: topic.to_string(),
                        reason: format!("empty {kind} payload"),
                    });
                }
                let body = text.to_string();
                Ok(match kind {
                    MessageKind::Offer => SignalingEvent::Offer { from, sdp: body },
                    MessageKind::Answer => SignalingEvent::Answer { from, sdp: body },
                    _ => SignalingEvent::IceCandidate {
                        from,
                        candidate: body,
                    },
                })
            }
        }
    }
}

fn malformed(topic: &str, reason: &'static str) -> RouteError {
    RouteError::MalformedTopic {
        topic: topic.to_string(),
        reason,
    }
}
