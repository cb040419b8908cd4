use std::env;
use std::time::Duration;

use crate::channel::DEFAULT_CHANNEL_LABEL;
use crate::detection::{DetectorSettings, LabelFilter};
use crate::error::ConfigError;
use crate::identity::PeerId;
use crate::lost_items::{DiffPolicy, OccupancyMonitor};
use crate::registry::DEFAULT_IDLE_EXPIRY;
use crate::router::DEFAULT_NAMESPACE;
use crate::session::HelloResponse;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_PERSON_LABEL: &str = "person";

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub client_id: PeerId,
    pub namespace: String,
    pub redis_url: Option<String>,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub hello_response: HelloResponse,
    /// How long a peer slot without a running session survives.
    pub idle_expiry: Duration,
    pub diff_policy: DiffPolicy,
    pub exclude_labels: Vec<String>,
    pub person_label: String,
    pub detector: DetectorSettings,
    pub log_filter: String,
}

impl SignalingConfig {
    /// Defaults for everything but the identity.
    pub fn new(client_id: PeerId) -> Self {
        Self {
            client_id,
            namespace: DEFAULT_NAMESPACE.to_string(),
            redis_url: None,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            hello_response: HelloResponse::default(),
            idle_expiry: DEFAULT_IDLE_EXPIRY,
            diff_policy: DiffPolicy::default(),
            exclude_labels: Vec::new(),
            person_label: DEFAULT_PERSON_LABEL.to_string(),
            detector: DetectorSettings::default(),
            log_filter: "info".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let raw_id = env::var("SIGNAL_CLIENT_ID").map_err(|_| ConfigError::Missing("SIGNAL_CLIENT_ID"))?;
        let client_id = PeerId::new(raw_id.trim()).map_err(|err| ConfigError::Invalid {
            key: "SIGNAL_CLIENT_ID",
            reason: err.to_string(),
        })?;
        let mut config = Self::new(client_id);

        if let Some(namespace) = non_empty("SIGNAL_NAMESPACE") {
            if namespace.contains(['/', '#', '+']) {
                return Err(ConfigError::Invalid {
                    key: "SIGNAL_NAMESPACE",
                    reason: format!("'{namespace}' must be a single topic level"),
                });
            }
            config.namespace = namespace;
        }
        config.redis_url = non_empty("SIGNAL_REDIS_URL");
        if let Some(servers) = non_empty("SIGNAL_ICE_SERVERS") {
            config.ice_servers = split_list(&servers);
        }
        if let Some(label) = non_empty("SIGNAL_CHANNEL_LABEL") {
            config.channel_label = label;
        }
        config.hello_response = env::var("SIGNAL_HELLO_RESPONSE")
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "offer" => HelloResponse::Offer,
                _ => HelloResponse::AwaitOffer,
            })
            .unwrap_or_default();
        if let Some(secs) = non_empty("SIGNAL_IDLE_EXPIRY_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::Invalid {
                key: "SIGNAL_IDLE_EXPIRY_SECS",
                reason: format!("'{secs}' is not a whole number of seconds"),
            })?;
            config.idle_expiry = Duration::from_secs(secs);
        }
        config.diff_policy = env::var("SIGNAL_DIFF_POLICY")
            .ok()
            .and_then(|v| DiffPolicy::parse(&v))
            .unwrap_or_default();
        if let Some(labels) = non_empty("SIGNAL_EXCLUDE_LABELS") {
            config.exclude_labels = split_list(&labels);
        }
        if let Some(label) = non_empty("SIGNAL_PERSON_LABEL") {
            config.person_label = label;
        }
        config.detector = DetectorSettings {
            interval: env::var("SIGNAL_DETECT_INTERVAL_MS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(config.detector.interval),
            score_threshold: env::var("SIGNAL_SCORE_THRESHOLD")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|t: &f32| (0.0..=1.0).contains(t))
                .unwrap_or(config.detector.score_threshold),
            max_results: env::var("SIGNAL_MAX_RESULTS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(config.detector.max_results),
        };
        config.log_filter = env::var("SIGNAL_LOG")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info,peer_signaling=debug".into());
        Ok(config)
    }

    pub fn label_filter(&self) -> LabelFilter {
        LabelFilter::new(self.exclude_labels.iter().cloned())
    }

    pub fn occupancy_monitor(&self) -> OccupancyMonitor {
        OccupancyMonitor::new(self.person_label.clone(), self.diff_policy)
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_settings() {
        let config = SignalingConfig::new(PeerId::new("cam-1").expect("id"));
        assert_eq!(config.namespace, "webrtc");
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.channel_label, "detections");
        assert_eq!(config.hello_response, HelloResponse::AwaitOffer);
        assert_eq!(config.idle_expiry, Duration::from_secs(30));
        assert_eq!(config.diff_policy, DiffPolicy::Multiset);
        assert_eq!(config.detector.interval, Duration::from_millis(500));
        assert_eq!(config.detector.max_results, 5);
    }

    #[test]
    fn list_values_are_trimmed() {
        assert_eq!(
            split_list(" tv, chair ,,bench"),
            vec!["tv".to_string(), "chair".to_string(), "bench".to_string()]
        );
        let config = SignalingConfig {
            exclude_labels: split_list("tv,chair"),
            ..SignalingConfig::new(PeerId::new("cam-1").expect("id"))
        };
        assert!(!config.label_filter().allows("tv"));
        assert!(config.label_filter().allows("cup"));
    }
}
