use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Bus, BusError, BusMessage, BusResult, BusStatus, TopicPattern, SUBSCRIBER_CAPACITY};

const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    pub url: String,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RedisBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

type Subscriptions = Arc<RwLock<HashMap<TopicPattern, broadcast::Sender<BusMessage>>>>;

/// Redis pub/sub backed bus.
///
/// Subscriptions are PSUBSCRIBE globs re-checked against the MQTT pattern on
/// delivery. A reader task owns the pub/sub connection and reconnects with
/// exponential backoff; a writer task drains outbound messages through a
/// `ConnectionManager`, so `publish` never blocks the caller. A publish that
/// hits a dropped connection is retried with the same backoff, in order,
/// until the manager has reconnected.
pub struct RedisBus {
    subscriptions: Subscriptions,
    outbound: mpsc::UnboundedSender<BusMessage>,
    resubscribe: mpsc::UnboundedSender<()>,
    status: watch::Receiver<BusStatus>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RedisBus {
    pub async fn connect(config: RedisBusConfig) -> BusResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| BusError::Transport(err.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));
        let (status_tx, status_rx) = watch::channel(BusStatus::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (resubscribe_tx, resubscribe_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(manager, config.clone(), outbound_rx));
        let reader = tokio::spawn(run_reader(
            client,
            config,
            subscriptions.clone(),
            resubscribe_rx,
            status_tx,
        ));

        Ok(Self {
            subscriptions,
            outbound: outbound_tx,
            resubscribe: resubscribe_tx,
            status: status_rx,
            reader,
            writer,
        })
    }

    pub fn status(&self) -> watch::Receiver<BusStatus> {
        self.status.clone()
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Bus for RedisBus {
    fn subscribe(&self, pattern: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        let pattern = TopicPattern::parse(pattern)?;
        let (receiver, fresh) = match self.subscriptions.write().entry(pattern) {
            Entry::Occupied(entry) => (entry.get().subscribe(), false),
            Entry::Vacant(entry) => {
                let (sender, receiver) = broadcast::channel(SUBSCRIBER_CAPACITY);
                entry.insert(sender);
                (receiver, true)
            }
        };
        if fresh {
            self.resubscribe.send(()).map_err(|_| BusError::Closed)?;
        }
        Ok(receiver)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.outbound
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }
}

async fn run_writer(
    manager: redis::aio::ConnectionManager,
    config: RedisBusConfig,
    mut outbound: mpsc::UnboundedReceiver<BusMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let result = with_backoff(&config, is_transient, || {
            let mut manager = manager.clone();
            let message = message.clone();
            async move {
                let receivers: redis::RedisResult<i64> = manager
                    .publish(message.topic.as_str(), message.payload.as_ref())
                    .await;
                receivers
            }
        })
        .await;
        match result {
            Ok(receivers) => {
                debug!(target = "bus.redis", topic = %message.topic, receivers, "published");
            }
            Err(err) => {
                warn!(target = "bus.redis", topic = %message.topic, error = %err, "publish rejected; message dropped");
            }
        }
    }
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Runs `attempt` until it succeeds or fails in a way `retryable` rejects,
/// sleeping between tries with exponential backoff.
async fn with_backoff<T, E, F, Fut>(
    config: &RedisBusConfig,
    retryable: impl Fn(&E) -> bool,
    mut attempt: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = config.backoff_min;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) => {
                warn!(target = "bus.redis", error = %err, delay_ms = backoff.as_millis() as u64, "publish failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.backoff_max);
            }
            Err(err) => return Err(err),
        }
    }
}

async fn run_reader(
    client: redis::Client,
    config: RedisBusConfig,
    subscriptions: Subscriptions,
    mut resubscribe: mpsc::UnboundedReceiver<()>,
    status: watch::Sender<BusStatus>,
) {
    let mut backoff = config.backoff_min;
    loop {
        let _ = status.send(BusStatus::Connecting);
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(target = "bus.redis", error = %err, delay_ms = backoff.as_millis() as u64, "pubsub connect failed");
                let _ = status.send(BusStatus::Disconnected);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.backoff_max);
                continue;
            }
        };

        let globs: Vec<String> = subscriptions
            .read()
            .keys()
            .map(TopicPattern::to_glob)
            .collect();
        let mut subscribed = true;
        for glob in &globs {
            if let Err(err) = pubsub.psubscribe(glob.as_str()).await {
                warn!(target = "bus.redis", glob = %glob, error = %err, "psubscribe failed");
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            let _ = status.send(BusStatus::Disconnected);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.backoff_max);
            continue;
        }

        info!(target = "bus.redis", patterns = globs.len(), "pubsub connected");
        let _ = status.send(BusStatus::Connected);
        backoff = config.backoff_min;

        let refresh = {
            let mut stream = Box::pin(pubsub.on_message());
            loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        Some(msg) => deliver(&subscriptions, msg.get_channel_name(), msg.get_payload_bytes()),
                        None => break false,
                    },
                    cmd = resubscribe.recv() => match cmd {
                        Some(()) => break true,
                        None => return,
                    },
                }
            }
        };

        if refresh {
            debug!(target = "bus.redis", "refreshing pattern subscriptions");
            continue;
        }
        warn!(target = "bus.redis", delay_ms = backoff.as_millis() as u64, "pubsub stream ended; reconnecting");
        let _ = status.send(BusStatus::Disconnected);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.backoff_max);
    }
}

fn deliver(subscriptions: &Subscriptions, topic: &str, payload: &[u8]) {
    let message = BusMessage {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
    };
    let guard = subscriptions.read();
    for (pattern, sender) in guard.iter() {
        if pattern.matches(topic) {
            let _ = sender.send(message.clone());
        }
    }
}
