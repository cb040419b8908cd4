//! Wires the bus, the topic router and the session registry together.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusMessage, LocalBus};

use crate::channel::{BroadcastReport, DataChannelManager};
use crate::config::SignalingConfig;
use crate::detection::DetectionPipeline;
use crate::error::{ChannelError, EngineError, SessionError};
use crate::identity::PeerId;
use crate::lost_items::LostItemAlert;
use crate::metrics;
use crate::outbound::SignalPublisher;
use crate::registry::{SessionRegistry, TeardownReport};
use crate::router::TopicRouter;
use crate::session::SessionEvent;
use crate::transport::TransportFactory;

/// One device's signaling endpoint: subscribes to its own inbound topics
/// and drives a session per remote peer.
pub struct SignalingEngine {
    router: TopicRouter,
    registry: SessionRegistry,
    pump: JoinHandle<()>,
}

impl SignalingEngine {
    pub fn start(
        bus: Arc<dyn Bus>,
        factory: Arc<dyn TransportFactory>,
        config: &SignalingConfig,
    ) -> Result<Self, EngineError> {
        let router = TopicRouter::new(config.namespace.clone(), config.client_id.clone());
        let publisher = SignalPublisher::new(
            bus.clone(),
            config.namespace.clone(),
            config.client_id.clone(),
        );
        let registry = SessionRegistry::new(
            publisher,
            factory,
            DataChannelManager::new(&config.channel_label),
            config.hello_response,
        );
        registry.set_idle_expiry(config.idle_expiry);
        let inbound = bus.subscribe(&router.inbound_pattern())?;
        let pump = tokio::spawn(pump_inbound(inbound, router.clone(), registry.clone()));
        info!(
            target = "signaling.engine",
            client_id = %config.client_id,
            pattern = %router.inbound_pattern(),
            "signaling engine started"
        );
        Ok(Self {
            router,
            registry,
            pump,
        })
    }

    pub fn self_id(&self) -> &PeerId {
        self.router.self_id()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &DataChannelManager {
        self.registry.channels()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe_events()
    }

    /// Calls `peer`: builds a transport and publishes an offer.
    pub async fn initiate(&self, peer: &PeerId) -> Result<(), EngineError> {
        self.registry.initiate(peer).await?;
        Ok(())
    }

    /// Asks `peer` to call us.
    pub async fn announce(&self, peer: &PeerId) -> Result<(), EngineError> {
        self.registry.announce(peer).await?;
        Ok(())
    }

    pub async fn hang_up(&self, peer: &PeerId) -> Result<(), SessionError> {
        self.registry.remove(peer).await
    }

    pub async fn send(&self, peer: &PeerId, payload: &str) -> Result<(), ChannelError> {
        self.channels().send(peer, payload).await
    }

    /// Closes the data channel to `peer` without ending the call.
    pub async fn close_channel(&self, peer: &PeerId) -> Result<(), ChannelError> {
        self.channels().close(peer).await
    }

    /// Reopens the data channel of a connected peer.
    pub async fn reopen_channel(&self, peer: &PeerId) -> Result<(), EngineError> {
        let mut session = self.registry.get_or_create(peer).await?;
        self.channels().open(&mut session)?;
        Ok(())
    }

    pub async fn broadcast(&self, payload: &str) -> BroadcastReport {
        self.channels().broadcast(payload).await
    }

    /// Starts pushing detection frames to every open channel, with the
    /// filter, occupancy monitor and pacing taken from `config`.
    pub fn start_detection(
        &self,
        config: &SignalingConfig,
        alerts: mpsc::Sender<LostItemAlert>,
    ) -> DetectionPipeline {
        DetectionPipeline::spawn(
            self.channels().clone(),
            config.label_filter(),
            config.occupancy_monitor(),
            config.detector.interval,
            alerts,
        )
    }

    /// Stops consuming the bus, then tears every session down.
    pub async fn shutdown(self) -> TeardownReport {
        self.pump.abort();
        let report = self.registry.teardown_all().await;
        for (peer, err) in &report.failures {
            warn!(target = "signaling.engine", peer = %peer, error = %err, "teardown incomplete");
        }
        report
    }
}

impl Drop for SignalingEngine {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Bus chosen by configuration: Redis when a URL is set, in-process otherwise.
pub async fn connect_bus(config: &SignalingConfig) -> Result<Arc<dyn Bus>, EngineError> {
    if let Some(url) = &config.redis_url {
        if let Some(bus) = networked_bus(url).await? {
            return Ok(bus);
        }
    }
    Ok(Arc::new(LocalBus::new()))
}

#[cfg(feature = "redis-bus")]
async fn networked_bus(url: &str) -> Result<Option<Arc<dyn Bus>>, EngineError> {
    let bus = transport_bus::RedisBus::connect(transport_bus::RedisBusConfig::new(url)).await?;
    info!(target = "signaling.engine", "connected to redis bus");
    Ok(Some(Arc::new(bus)))
}

#[cfg(not(feature = "redis-bus"))]
async fn networked_bus(_url: &str) -> Result<Option<Arc<dyn Bus>>, EngineError> {
    warn!(target = "signaling.engine", "redis url set but built without redis-bus; using in-process bus");
    Ok(None)
}

async fn pump_inbound(
    mut inbound: broadcast::Receiver<BusMessage>,
    router: TopicRouter,
    registry: SessionRegistry,
) {
    loop {
        match inbound.recv().await {
            Ok(message) => match router.route(&message.topic, &message.payload) {
                Ok(event) => {
                    debug!(
                        target = "signaling.engine",
                        peer = %event.from(),
                        kind = %event.kind(),
                        "signal received"
                    );
                    metrics::SIGNALS_ROUTED
                        .with_label_values(&[event.kind().wire_name()])
                        .inc();
                    registry.dispatch(event);
                }
                Err(err) => {
                    metrics::ROUTE_ERRORS
                        .with_label_values(&[err.reason_label()])
                        .inc();
                    warn!(target = "signaling.engine", error = %err, "dropping inbound message");
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "signaling.engine", skipped, "inbound signaling lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(target = "signaling.engine", "inbound pump stopped");
}
