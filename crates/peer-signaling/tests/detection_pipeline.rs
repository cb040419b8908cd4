mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use peer_signaling::detection::{DetectorSettings, NO_LABEL_PAYLOAD};
use peer_signaling::transport::mock::MockOptions;
use peer_signaling::{
    DetectionFrame, DetectionPipeline, DiffPolicy, LabelFilter, OccupancyMonitor, SignalingConfig,
};
use tokio::sync::mpsc;
use transport_bus::LocalBus;

fn frame(raw: &[&str]) -> DetectionFrame {
    DetectionFrame::new(raw.iter().map(|s| s.to_string()).collect())
}

/// Retries until the pipeline has room, so frames keep their order.
async fn feed(pipeline: &DetectionPipeline, frame: DetectionFrame) {
    tokio::time::timeout(WAIT, async {
        while !pipeline.submit(frame.clone()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pipeline accepted frame");
}

#[tokio::test]
async fn detections_reach_viewer_and_leftovers_raise_alert() {
    let bus = Arc::new(LocalBus::new());
    let mut cam = endpoint(&bus, "cam", MockOptions::default());
    let viewer = endpoint(&bus, "viewer", MockOptions::default());

    cam.engine.initiate(&viewer.id).await.expect("initiate");
    wait_connected(&mut cam.events, &viewer.id).await;
    eventually(|| cam.engine.channels().is_ready(&viewer.id)).await;

    let config = SignalingConfig {
        exclude_labels: vec!["chair".into()],
        detector: DetectorSettings {
            interval: Duration::ZERO,
            ..DetectorSettings::default()
        },
        ..SignalingConfig::new(cam.id.clone())
    };
    let (alerts_tx, mut alerts) = mpsc::channel(4);
    let pipeline = cam.engine.start_detection(&config, alerts_tx);

    feed(&pipeline, frame(&["cup", "chair"])).await;
    feed(&pipeline, frame(&["person", "cup", "umbrella"])).await;
    feed(&pipeline, frame(&["chair"])).await;

    let alert = tokio::time::timeout(WAIT, alerts.recv())
        .await
        .expect("alert in time")
        .expect("alert sink open");
    assert_eq!(alert.items, "cup");

    eventually(|| cam.ledger.sent_messages(&viewer.id).len() == 3).await;
    assert_eq!(
        cam.ledger.sent_messages(&viewer.id),
        vec![
            "cup/".to_string(),
            "person/cup/umbrella/".to_string(),
            NO_LABEL_PAYLOAD.to_string(),
        ]
    );
}

#[tokio::test]
async fn busy_pipeline_drops_frames() {
    let (alerts_tx, _alerts) = mpsc::channel(1);
    let pipeline = DetectionPipeline::spawn(
        Default::default(),
        LabelFilter::default(),
        OccupancyMonitor::new("person", DiffPolicy::Multiset),
        Duration::from_millis(200),
        alerts_tx,
    );

    // one frame in flight and one queued; anything else is refused
    feed(&pipeline, frame(&["cup"])).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(pipeline.submit(frame(&["cup"])));
    assert!(!pipeline.submit(frame(&["cup"])));
}
