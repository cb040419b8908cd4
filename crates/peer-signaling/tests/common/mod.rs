#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use peer_signaling::transport::mock::{MockLedger, MockOptions, MockTransportFactory};
use peer_signaling::{HelloResponse, PeerId, SessionEvent, SignalingConfig, SignalingEngine};
use tokio::sync::broadcast;
use transport_bus::LocalBus;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn peer(name: &str) -> PeerId {
    PeerId::new(name).expect("valid peer id")
}

pub struct Endpoint {
    pub id: PeerId,
    pub engine: SignalingEngine,
    pub ledger: Arc<MockLedger>,
    pub events: broadcast::Receiver<SessionEvent>,
}

pub fn endpoint(bus: &Arc<LocalBus>, name: &str, options: MockOptions) -> Endpoint {
    endpoint_with(bus, name, options, HelloResponse::AwaitOffer)
}

pub fn endpoint_with(
    bus: &Arc<LocalBus>,
    name: &str,
    options: MockOptions,
    hello_response: HelloResponse,
) -> Endpoint {
    let factory = MockTransportFactory::new(options);
    let ledger = factory.ledger();
    let config = SignalingConfig {
        hello_response,
        ..SignalingConfig::new(peer(name))
    };
    let engine =
        SignalingEngine::start(bus.clone(), Arc::new(factory), &config).expect("engine starts");
    let events = engine.subscribe_events();
    Endpoint {
        id: peer(name),
        engine,
        ledger,
        events,
    }
}

/// Next event matching `pred`, skipping everything else.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected session event")
}

pub async fn wait_connected(events: &mut broadcast::Receiver<SessionEvent>, remote: &PeerId) {
    wait_for(events, |event| {
        matches!(event, SessionEvent::Connected { peer } if peer == remote)
    })
    .await;
}

pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub async fn eventually_async<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn mock_sdp(tag: &str) -> String {
    format!("v=0\r\no=remote 7 1 IN IP4 0.0.0.0\r\ns={tag}\r\n")
}

pub fn host_candidate(n: u32) -> String {
    format!("candidate:{n} 1 udp {} 192.168.1.{n} 5000{n} typ host", 2_000_000_000 - n)
}
