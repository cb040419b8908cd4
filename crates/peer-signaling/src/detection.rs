//! Detection results on their way to connected peers.
//!
//! Frames come from an external vision pipeline as label lists. Each frame
//! is filtered, rendered as a `label/label/` payload, pushed to every open
//! data channel and handed to the [`OccupancyMonitor`] for lost-item checks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::DataChannelManager;
use crate::lost_items::{LostItemAlert, OccupancyMonitor};

pub const NO_LABEL_PAYLOAD: &str = "no label";

/// Inference output for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLabel {
    pub label: String,
    pub score: f32,
}

impl ScoredLabel {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub interval: Duration,
    pub score_threshold: f32,
    pub max_results: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            score_threshold: 0.5,
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LabelFilter {
    excluded: HashSet<String>,
}

impl LabelFilter {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, label: &str) -> bool {
        !self.excluded.contains(label)
    }
}

/// Immutable label snapshot of one frame. Cloning shares the labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionFrame {
    labels: Arc<[String]>,
}

impl DetectionFrame {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels: labels.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Keeps the highest-scoring detections that clear the threshold.
    pub fn from_scored<I>(detections: I, settings: &DetectorSettings) -> Self
    where
        I: IntoIterator<Item = ScoredLabel>,
    {
        let mut kept: Vec<ScoredLabel> = detections
            .into_iter()
            .filter(|d| d.score >= settings.score_threshold)
            .collect();
        kept.sort_by(|a, b| b.score.total_cmp(&a.score));
        kept.truncate(settings.max_results);
        Self::new(kept.into_iter().map(|d| d.label).collect())
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn filtered(&self, filter: &LabelFilter) -> Self {
        Self::new(
            self.labels
                .iter()
                .filter(|label| filter.allows(label))
                .cloned()
                .collect(),
        )
    }

    /// `person/cup/`, or the placeholder when nothing was detected.
    pub fn to_payload(&self) -> String {
        if self.labels.is_empty() {
            return NO_LABEL_PAYLOAD.to_string();
        }
        self.labels.iter().fold(String::new(), |mut out, label| {
            out.push_str(label);
            out.push('/');
            out
        })
    }
}

/// Running detection fan-out task. Dropping it stops the task.
pub struct DetectionPipeline {
    frames: mpsc::Sender<DetectionFrame>,
    handle: JoinHandle<()>,
}

impl DetectionPipeline {
    pub fn spawn(
        channels: DataChannelManager,
        filter: LabelFilter,
        mut monitor: OccupancyMonitor,
        interval: Duration,
        alerts: mpsc::Sender<LostItemAlert>,
    ) -> Self {
        // one slot: frames arriving while a frame is in flight are dropped
        let (frames, mut rx) = mpsc::channel::<DetectionFrame>(1);
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let frame = frame.filtered(&filter);
                let payload = frame.to_payload();
                let report = channels.broadcast(&payload).await;
                debug!(
                    target = "signaling.detection",
                    payload = %payload,
                    delivered = report.delivered.len(),
                    skipped = report.skipped.len(),
                    "detections pushed"
                );
                if let Some(alert) = monitor.observe(&frame) {
                    info!(target = "signaling.detection", items = %alert.items, "items left behind");
                    if alerts.send(alert).await.is_err() {
                        warn!(target = "signaling.detection", "alert sink closed");
                    }
                }
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
        });
        Self { frames, handle }
    }

    /// Offers a frame; returns false when the pipeline is still busy.
    pub fn submit(&self, frame: DetectionFrame) -> bool {
        self.frames.try_send(frame).is_ok()
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
