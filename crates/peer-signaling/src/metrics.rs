use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("static metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static SIGNALS_ROUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_routed_total",
        "inbound signaling messages decoded by kind",
        &["kind"],
    )
});

pub static ROUTE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_route_errors_total",
        "inbound signaling messages dropped by reason",
        &["reason"],
    )
});

pub static SIGNALS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_published_total",
        "outbound signaling messages by kind",
        &["kind"],
    )
});

pub static PUBLISH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_publish_failures_total",
        "outbound signaling messages the bus refused by kind",
        &["kind"],
    )
});

pub static SESSION_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_session_transitions_total",
        "peer session state entries by state",
        &["state"],
    )
});

pub static CANDIDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_remote_candidates_total",
        "remote ICE candidates by outcome",
        &["outcome"],
    )
});

pub static CHANNEL_SENDS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signaling_channel_sends_total",
        "data channel sends by outcome",
        &["result"],
    )
});

pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "signaling_sessions_active",
        "peer sessions currently held by the registry",
    ))
    .expect("static metric opts");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Text exposition of every signaling metric.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
