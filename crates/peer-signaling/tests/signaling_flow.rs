mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use peer_signaling::engine::connect_bus;
use peer_signaling::transport::mock::MockOptions;
use peer_signaling::transport::{LinkState, MediaKind, TransportEvent};
use peer_signaling::{ChannelError, HelloResponse, SessionEvent, SessionState, SignalingConfig};
use transport_bus::{Bus, LocalBus};

#[tokio::test]
async fn offer_answer_round_trip_connects_both_sides() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let mut viewer = endpoint(&bus, "viewer", MockOptions::default());

    viewer.engine.initiate(&cam.id).await.expect("initiate");

    wait_connected(&mut viewer.events, &cam.id).await;
    wait_connected(&mut cam.events, &viewer.id).await;

    assert_eq!(cam.ledger.created(), 1);
    assert_eq!(viewer.ledger.created(), 1);
    assert!(viewer.ledger.log().contains(&"remote-answer:cam".to_string()));
    assert!(cam.ledger.log().contains(&"remote-offer:viewer".to_string()));

    // each side received the other's trickled candidate
    eventually(|| cam.ledger.applied_candidates(&viewer.id).len() == 1).await;
    eventually(|| viewer.ledger.applied_candidates(&cam.id).len() == 1).await;
}

#[tokio::test]
async fn hello_makes_the_callee_offer() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint_with(&bus, "cam", MockOptions::default(), HelloResponse::Offer);
    let mut viewer = endpoint(&bus, "viewer", MockOptions::default());

    viewer.engine.announce(&cam.id).await.expect("announce");

    wait_connected(&mut viewer.events, &cam.id).await;
    wait_connected(&mut cam.events, &viewer.id).await;
    assert!(cam.ledger.log().contains(&"offer:viewer".to_string()));
    assert!(viewer.ledger.log().contains(&"answer:cam".to_string()));
}

#[tokio::test]
async fn channel_sends_only_after_it_opens() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = endpoint(&bus, "viewer", MockOptions::default());

    let early = cam.engine.send(&viewer.id, "person/").await;
    assert!(matches!(early, Err(ChannelError::ChannelNotReady(_))));

    cam.engine.initiate(&viewer.id).await.expect("initiate");
    wait_connected(&mut cam.events, &viewer.id).await;
    eventually(|| cam.engine.channels().is_ready(&viewer.id)).await;

    cam.engine.send(&viewer.id, "person/").await.expect("send");
    let report = cam.engine.broadcast("cup/").await;
    assert_eq!(report.delivered, vec![viewer.id.clone()]);
    assert!(report.skipped.is_empty());
    assert_eq!(
        cam.ledger.sent_messages(&viewer.id),
        vec!["person/".to_string(), "cup/".to_string()]
    );

    let unknown = cam.engine.send(&peer("nobody"), "x").await;
    assert!(matches!(unknown, Err(ChannelError::ChannelNotReady(_))));
}

#[tokio::test]
async fn send_fails_fast_while_negotiating() {
    let bus = Arc::new(LocalBus::new());
    let cam = endpoint(
        &bus,
        "cam",
        MockOptions {
            manual_connect: true,
            ..MockOptions::default()
        },
    );
    let _viewer = endpoint(&bus, "viewer", MockOptions::default());

    cam.engine.initiate(&peer("viewer")).await.expect("initiate");
    let sent = tokio::time::timeout(
        Duration::from_millis(200),
        cam.engine.send(&peer("viewer"), "person/"),
    )
    .await
    .expect("send must not wait for negotiation");
    assert!(matches!(sent, Err(ChannelError::ChannelNotReady(_))));
}

#[tokio::test]
async fn inbound_channel_text_surfaces_as_event() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = endpoint(&bus, "viewer", MockOptions::default());

    cam.engine.initiate(&viewer.id).await.expect("initiate");
    wait_connected(&mut cam.events, &viewer.id).await;

    assert!(cam
        .ledger
        .inject(&viewer.id, TransportEvent::ChannelMessage("monitor:on".into())));
    let event = wait_for(&mut cam.events, |event| {
        matches!(event, SessionEvent::Message { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::Message {
            peer: viewer.id.clone(),
            text: "monitor:on".into(),
        }
    );
}

#[tokio::test]
async fn hang_up_releases_transport_and_reports_disconnect() {
    let bus = Arc::new(LocalBus::new());
    let cam = endpoint(&bus, "cam", MockOptions::default());
    let mut viewer = endpoint(&bus, "viewer", MockOptions::default());

    viewer.engine.initiate(&cam.id).await.expect("initiate");
    wait_connected(&mut viewer.events, &cam.id).await;
    eventually(|| viewer.engine.channels().is_ready(&cam.id)).await;

    viewer.engine.hang_up(&cam.id).await.expect("hang up");
    let event = wait_for(&mut viewer.events, |event| {
        matches!(event, SessionEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::Disconnected {
            peer: cam.id.clone(),
            reason: None,
        }
    );
    assert_eq!(viewer.ledger.live(), 0);
    assert!(!viewer.engine.channels().is_ready(&cam.id));
    assert!(viewer.engine.registry().snapshot(&cam.id).await.is_none());
    assert!(viewer.engine.registry().peers().is_empty());

    // second hang up is a no-op
    viewer.engine.hang_up(&cam.id).await.expect("idempotent");
}

#[tokio::test]
async fn link_failure_after_connect_closes_cleanly() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = endpoint(&bus, "viewer", MockOptions::default());

    cam.engine.initiate(&viewer.id).await.expect("initiate");
    wait_connected(&mut cam.events, &viewer.id).await;

    cam.ledger
        .inject(&viewer.id, TransportEvent::Link(LinkState::Disconnected));
    cam.ledger
        .inject(&viewer.id, TransportEvent::Link(LinkState::Failed));

    let event = wait_for(&mut cam.events, |event| {
        matches!(event, SessionEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::Disconnected {
            peer: viewer.id.clone(),
            reason: None,
        }
    );
    assert_eq!(cam.ledger.live(), 0);
    let registry = cam.engine.registry().clone();
    let gone = viewer.id.clone();
    eventually_async(|| {
        let registry = registry.clone();
        let gone = gone.clone();
        async move { registry.snapshot(&gone).await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn link_failure_while_negotiating_fails_session() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(
        &bus,
        "cam",
        MockOptions {
            manual_connect: true,
            ..MockOptions::default()
        },
    );

    cam.engine.initiate(&peer("viewer")).await.expect("initiate");
    cam.ledger
        .inject(&peer("viewer"), TransportEvent::Link(LinkState::Failed));

    wait_for(&mut cam.events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged { state: SessionState::Failed, .. }
        )
    })
    .await;
    let event = wait_for(&mut cam.events, |event| {
        matches!(event, SessionEvent::Disconnected { .. })
    })
    .await;
    let SessionEvent::Disconnected { reason, .. } = event else {
        unreachable!();
    };
    assert!(reason.is_some());
    assert_eq!(cam.ledger.live(), 0);
}

#[tokio::test]
async fn setup_failure_is_reported_to_caller() {
    let bus = Arc::new(LocalBus::new());
    let cam = endpoint(
        &bus,
        "cam",
        MockOptions {
            fail_setup_for: [peer("ghost")].into_iter().collect(),
            ..MockOptions::default()
        },
    );

    assert!(cam.engine.initiate(&peer("ghost")).await.is_err());
    assert!(cam.engine.registry().peers().is_empty());
    assert_eq!(cam.ledger.created(), 0);
}

#[tokio::test]
async fn remote_candidates_apply_in_arrival_order() {
    let bus = Arc::new(LocalBus::new());
    let cam = endpoint(
        &bus,
        "cam",
        MockOptions {
            op_latency: Some(Duration::from_millis(30)),
            ..MockOptions::default()
        },
    );
    let mut replies = bus.subscribe("webrtc/viewer/#").expect("subscribe");

    let publish = |topic: &str, payload: String| {
        bus.publish(topic, Bytes::from(payload)).expect("publish");
    };
    publish("webrtc/cam/viewer/offer", mock_sdp("first"));
    let mut expected = Vec::new();
    for n in 1..=5 {
        if n == 3 {
            publish("webrtc/cam/viewer/ice", "not a candidate".into());
        }
        publish("webrtc/cam/viewer/ice", host_candidate(n));
        expected.push(host_candidate(n));
    }

    let viewer = peer("viewer");
    eventually(|| cam.ledger.applied_candidates(&viewer).len() == expected.len()).await;
    assert_eq!(cam.ledger.applied_candidates(&viewer), expected);

    // the answer goes out before any of our own candidates
    let first = tokio::time::timeout(WAIT, replies.recv())
        .await
        .expect("reply")
        .expect("bus open");
    assert_eq!(first.topic, "webrtc/viewer/cam/answer");
}

#[tokio::test]
async fn duplicate_offer_is_ignored_and_new_offer_restarts() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = peer("viewer");

    let offer = Bytes::from(mock_sdp("first"));
    bus.publish("webrtc/cam/viewer/offer", offer.clone())
        .expect("publish");
    bus.publish("webrtc/cam/viewer/offer", offer).expect("publish");
    wait_connected(&mut cam.events, &viewer).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cam.ledger.created(), 1);
    let applied = cam
        .ledger
        .log()
        .iter()
        .filter(|entry| *entry == "remote-offer:viewer")
        .count();
    assert_eq!(applied, 1);

    bus.publish("webrtc/cam/viewer/offer", Bytes::from(mock_sdp("restart")))
        .expect("publish");
    wait_connected(&mut cam.events, &viewer).await;
    assert_eq!(cam.ledger.created(), 2);
    assert_eq!(cam.ledger.max_live(), 1);
    assert_eq!(cam.ledger.live(), 1);
}

#[tokio::test]
async fn misaddressed_and_malformed_messages_are_dropped() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());

    bus.publish("webrtc/cam/viewer/bogus", Bytes::from_static(b"x"))
        .expect("publish");
    bus.publish("webrtc/cam/viewer/offer", Bytes::from_static(b""))
        .expect("publish");
    bus.publish("webrtc/other/viewer/ice", Bytes::from(host_candidate(1)))
        .expect("publish");
    bus.publish("webrtc/cam/stranger/answer", Bytes::from(mock_sdp("stray")))
        .expect("publish");
    // the engine keeps serving afterwards
    bus.publish("webrtc/cam/viewer/offer", Bytes::from(mock_sdp("ok")))
        .expect("publish");

    wait_connected(&mut cam.events, &peer("viewer")).await;
    assert_eq!(cam.ledger.created(), 1);
    assert_eq!(cam.engine.registry().peers(), vec![peer("viewer")]);
    assert!(cam.ledger.applied_candidates(&peer("viewer")).is_empty());
}

#[tokio::test]
async fn candidates_before_offer_apply_after_answer() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = peer("viewer");

    for n in 1..=2 {
        bus.publish("webrtc/cam/viewer/ice", Bytes::from(host_candidate(n)))
            .expect("publish");
    }
    let registry = cam.engine.registry().clone();
    eventually_async(|| {
        let registry = registry.clone();
        let viewer = viewer.clone();
        async move {
            registry
                .snapshot(&viewer)
                .await
                .is_some_and(|s| s.state == SessionState::New && s.pending_candidates == 2)
        }
    })
    .await;
    assert_eq!(cam.ledger.created(), 0);

    bus.publish("webrtc/cam/viewer/offer", Bytes::from(mock_sdp("late")))
        .expect("publish");
    wait_connected(&mut cam.events, &viewer).await;
    eventually(|| cam.ledger.applied_candidates(&viewer).len() == 2).await;
    assert_eq!(
        cam.ledger.applied_candidates(&viewer),
        vec![host_candidate(1), host_candidate(2)]
    );
    assert_eq!(cam.ledger.created(), 1);
}

#[tokio::test]
async fn repeated_candidate_is_applied_once() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = peer("viewer");

    bus.publish("webrtc/cam/viewer/offer", Bytes::from(mock_sdp("once")))
        .expect("publish");
    wait_connected(&mut cam.events, &viewer).await;

    for n in [1, 1, 2, 1] {
        bus.publish("webrtc/cam/viewer/ice", Bytes::from(host_candidate(n)))
            .expect("publish");
    }
    eventually(|| cam.ledger.applied_candidates(&viewer).len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        cam.ledger.applied_candidates(&viewer),
        vec![host_candidate(1), host_candidate(2)]
    );
}

#[tokio::test]
async fn closed_channel_can_be_reopened() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = endpoint(&bus, "viewer", MockOptions::default());

    cam.engine.initiate(&viewer.id).await.expect("initiate");
    wait_connected(&mut cam.events, &viewer.id).await;
    eventually(|| cam.engine.channels().is_ready(&viewer.id)).await;

    cam.engine.close_channel(&viewer.id).await.expect("close");
    assert!(!cam.engine.channels().is_ready(&viewer.id));
    assert!(matches!(
        cam.engine.send(&viewer.id, "cup/").await,
        Err(ChannelError::ChannelNotReady(_))
    ));
    cam.engine.close_channel(&viewer.id).await.expect("close again");

    cam.engine.reopen_channel(&viewer.id).await.expect("reopen");
    eventually(|| cam.engine.channels().is_ready(&viewer.id)).await;
    cam.engine.send(&viewer.id, "cup/").await.expect("send");
    assert_eq!(cam.ledger.sent_messages(&viewer.id), vec!["cup/".to_string()]);
    let opened = cam
        .ledger
        .log()
        .iter()
        .filter(|entry| *entry == "channel-open:viewer")
        .count();
    assert_eq!(opened, 2);
    let snapshot = cam.engine.registry().snapshot(&viewer.id).await.expect("session");
    assert_eq!(snapshot.state, SessionState::Connected);
}

#[tokio::test]
async fn local_tracks_are_attached_and_remote_tracks_reported() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(
        &bus,
        "cam",
        MockOptions {
            local_tracks: vec!["camera".into()],
            ..MockOptions::default()
        },
    );
    let viewer = endpoint(&bus, "viewer", MockOptions::default());

    cam.engine.initiate(&viewer.id).await.expect("initiate");
    wait_connected(&mut cam.events, &viewer.id).await;

    let log = cam.ledger.log();
    let attached = log
        .iter()
        .position(|entry| entry == "track-add:viewer:camera")
        .expect("track attached");
    let offered = log
        .iter()
        .position(|entry| entry == "offer:viewer")
        .expect("offer made");
    assert!(attached < offered);

    assert!(cam.ledger.inject(
        &viewer.id,
        TransportEvent::RemoteTrack {
            id: "viewer-mic".into(),
            kind: MediaKind::Audio,
        },
    ));
    let event = wait_for(&mut cam.events, |event| {
        matches!(event, SessionEvent::Track { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::Track {
            peer: viewer.id.clone(),
            track_id: "viewer-mic".into(),
            kind: MediaKind::Audio,
        }
    );
}

#[tokio::test(flavor = "current_thread")]
async fn simultaneous_offers_resolve_to_one_connection() {
    let bus = Arc::new(LocalBus::new());
    let mut alpha = endpoint(&bus, "alpha", MockOptions::default());
    let mut bravo = endpoint(&bus, "bravo", MockOptions::default());

    let (a, b) = tokio::join!(
        alpha.engine.initiate(&bravo.id),
        bravo.engine.initiate(&alpha.id)
    );
    a.expect("alpha initiates");
    b.expect("bravo initiates");

    wait_connected(&mut alpha.events, &bravo.id).await;
    wait_connected(&mut bravo.events, &alpha.id).await;

    // alpha kept its offer; bravo yielded and answered
    assert_eq!(alpha.ledger.created(), 1);
    assert_eq!(bravo.ledger.created(), 2);
    assert_eq!(bravo.ledger.max_live(), 1);
    assert!(bravo.ledger.log().contains(&"answer:alpha".to_string()));
}

#[tokio::test]
async fn configured_bus_without_redis_is_in_process() {
    let config = SignalingConfig::new(peer("cam"));
    let bus = connect_bus(&config)
        .await
        .expect("bus");
    let mut inbox = bus.subscribe("webrtc/cam/#").expect("subscribe");
    bus.publish("webrtc/cam/signal", Bytes::from_static(b"viewer"))
        .expect("publish");
    let message = inbox.recv().await.expect("delivered");
    assert_eq!(message.topic, "webrtc/cam/signal");
}
