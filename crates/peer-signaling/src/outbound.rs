use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use transport_bus::Bus;

use crate::error::SessionError;
use crate::identity::PeerId;
use crate::metrics;
use crate::router::MessageKind;

/// One signaling message on its way to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destination: PeerId,
    pub kind: MessageKind,
    pub payload: String,
}

impl OutboundEnvelope {
    pub fn new(destination: PeerId, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            destination,
            kind,
            payload: payload.into(),
        }
    }

    /// `<ns>/<dest>/signal` for Hello, `<ns>/<dest>/<src>/<kind>` otherwise.
    pub fn topic(&self, namespace: &str, source: &PeerId) -> String {
        match self.kind {
            MessageKind::Hello => format!("{namespace}/{}/{}", self.destination, self.kind),
            kind => format!("{namespace}/{}/{source}/{kind}", self.destination),
        }
    }
}

/// Publishes envelopes on behalf of the local identity.
#[derive(Clone)]
pub struct SignalPublisher {
    bus: Arc<dyn Bus>,
    namespace: String,
    self_id: PeerId,
}

impl SignalPublisher {
    pub fn new(bus: Arc<dyn Bus>, namespace: impl Into<String>, self_id: PeerId) -> Self {
        Self {
            bus,
            namespace: namespace.into(),
            self_id,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn publish(&self, envelope: &OutboundEnvelope) -> Result<(), SessionError> {
        let topic = envelope.topic(&self.namespace, &self.self_id);
        match self
            .bus
            .publish(&topic, Bytes::from(envelope.payload.clone()))
        {
            Ok(()) => {
                debug!(target = "signaling.outbound", topic = %topic, kind = %envelope.kind, "published");
                metrics::SIGNALS_PUBLISHED
                    .with_label_values(&[envelope.kind.wire_name()])
                    .inc();
                Ok(())
            }
            Err(err) => {
                metrics::PUBLISH_FAILURES
                    .with_label_values(&[envelope.kind.wire_name()])
                    .inc();
                Err(SessionError::PublishFailed {
                    peer: envelope.destination.clone(),
                    kind: envelope.kind.wire_name(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBus;

    fn id(raw: &str) -> PeerId {
        PeerId::new(raw).expect("id")
    }

    #[test]
    fn topics_follow_destination_first_scheme() {
        let me = id("cam");
        let hello = OutboundEnvelope::new(id("viewer"), MessageKind::Hello, "cam");
        assert_eq!(hello.topic("webrtc", &me), "webrtc/viewer/signal");
        let answer = OutboundEnvelope::new(id("viewer"), MessageKind::Answer, "v=0");
        assert_eq!(answer.topic("webrtc", &me), "webrtc/viewer/cam/answer");
        let ice = OutboundEnvelope::new(id("viewer"), MessageKind::Ice, "candidate:1");
        assert_eq!(ice.topic("webrtc", &me), "webrtc/viewer/cam/ice");
    }

    #[tokio::test]
    async fn publisher_writes_whole_payload() {
        let bus = Arc::new(LocalBus::new());
        let mut sub = bus.subscribe("webrtc/viewer/#").expect("subscribe");
        let publisher = SignalPublisher::new(bus.clone(), "webrtc", id("cam"));
        publisher
            .publish(&OutboundEnvelope::new(id("viewer"), MessageKind::Offer, "v=0\r\n"))
            .expect("publish");
        let msg = sub.recv().await.expect("message");
        assert_eq!(msg.topic, "webrtc/viewer/cam/offer");
        assert_eq!(msg.payload, Bytes::from_static(b"v=0\r\n"));
    }
}
