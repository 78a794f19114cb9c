//! Cross-session cache invalidation over a publish/subscribe channel.
//!
//! Delivery is at-most-once and best effort. Publishing never waits for
//! subscribers, and a lost message only leaves data stale until its staleness
//! window runs out. Subscribers that fall behind invalidate everything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::query::QueryCache;
use crate::api::ApiError;
use crate::utils::lock;

/// Shared channel every client subscribes to. Not partitioned per tenant.
pub const INVALIDATION_CHANNEL: &str = "global-cache-invalidation";

/// Event name carried by invalidation messages on the channel.
pub const INVALIDATION_EVENT: &str = "cache-invalidate";

/// Key prefixes refreshed by a `tasks` invalidation.
pub const TASK_PREFIXES: [&str; 2] = ["tasks", "opportunities"];

/// Default buffer size for in-process channels.
const DEFAULT_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum InvalidationKind {
    Full,
    Tasks,
}

impl std::fmt::Display for InvalidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationKind::Full => write!(f, "full"),
            InvalidationKind::Tasks => write!(f, "tasks"),
        }
    }
}

impl std::str::FromStr for InvalidationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(InvalidationKind::Full),
            "tasks" => Ok(InvalidationKind::Tasks),
            other => Err(format!("unknown invalidation type: {other}")),
        }
    }
}

/// Payload of an invalidation broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct InvalidationMessage {
    #[serde(rename = "type")]
    pub kind: InvalidationKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Identifies the publishing session.
    pub source: String,
}

impl InvalidationMessage {
    pub fn new(kind: InvalidationKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }

    /// Apply this message to `cache`. Returns how many entries were marked stale.
    pub fn apply(&self, cache: &QueryCache) -> usize {
        match self.kind {
            InvalidationKind::Full => cache.invalidate_all(),
            InvalidationKind::Tasks => TASK_PREFIXES
                .iter()
                .map(|prefix| cache.invalidate(&[prefix]))
                .sum(),
        }
    }
}

/// A message as carried by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Sending half of a publish/subscribe transport.
#[async_trait]
pub trait BroadcastPublisher: Send + Sync {
    /// Hand a message to the transport. Success means accepted, not delivered.
    async fn send(&self, message: BroadcastMessage) -> Result<(), ApiError>;
}

/// Receiving half of a publish/subscribe transport.
pub trait BroadcastSubscriber: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BroadcastMessage>;
}

// ============================================================================
// In-process transport
// ============================================================================

/// In-process transport connecting every session in one process.
///
/// Uses tokio's broadcast channel per channel name; slow receivers lose the
/// oldest messages, matching the at-most-once contract.
pub struct LocalHub {
    channels: Mutex<HashMap<String, broadcast::Sender<BroadcastMessage>>>,
    capacity: usize,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BroadcastMessage> {
        lock(&self.channels)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map_or(0, |s| s.receiver_count())
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("channels", &lock(&self.channels).len())
            .finish()
    }
}

#[async_trait]
impl BroadcastPublisher for LocalHub {
    async fn send(&self, message: BroadcastMessage) -> Result<(), ApiError> {
        let delivered = self
            .sender(&message.channel)
            .send(message)
            .unwrap_or_default();
        debug!(delivered, "Broadcast sent on local hub");
        Ok(())
    }
}

impl BroadcastSubscriber for LocalHub {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BroadcastMessage> {
        self.sender(channel).subscribe()
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Publishes and consumes invalidation messages for one session's cache.
pub struct InvalidationBroadcaster {
    publisher: Arc<dyn BroadcastPublisher>,
    cache: QueryCache,
    source: String,
}

impl InvalidationBroadcaster {
    pub fn new(publisher: Arc<dyn BroadcastPublisher>, cache: QueryCache, source: impl Into<String>) -> Self {
        Self {
            publisher,
            cache,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Invalidate locally, then broadcast to every other session.
    ///
    /// Fire-and-forget: transport failures are logged and swallowed.
    pub async fn publish(&self, kind: InvalidationKind) {
        let message = InvalidationMessage::new(kind, self.source.clone());
        let local = message.apply(&self.cache);

        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode invalidation message");
                return;
            }
        };
        let outcome = self
            .publisher
            .send(BroadcastMessage {
                channel: INVALIDATION_CHANNEL.to_string(),
                event: INVALIDATION_EVENT.to_string(),
                payload,
            })
            .await;

        match outcome {
            Ok(()) => info!(%kind, local, "Cache invalidation broadcast"),
            Err(e) => warn!(%kind, error = %e, "Cache invalidation broadcast dropped"),
        }
    }

    /// Start consuming invalidation messages into this session's cache.
    /// The task ends when the transport closes or the handle is aborted.
    pub fn subscribe(&self, subscriber: &dyn BroadcastSubscriber) -> JoinHandle<()> {
        let mut receiver = subscriber.subscribe(INVALIDATION_CHANNEL);
        let cache = self.cache.clone();
        let source = self.source.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => handle_message(&cache, &source, message),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Invalidation subscriber lagged, invalidating everything");
                        cache.invalidate_all();
                    }
                    Err(RecvError::Closed) => {
                        debug!("Invalidation channel closed");
                        break;
                    }
                }
            }
        })
    }
}

fn handle_message(cache: &QueryCache, own_source: &str, message: BroadcastMessage) {
    if message.event != INVALIDATION_EVENT {
        return;
    }
    match serde_json::from_value::<InvalidationMessage>(message.payload) {
        Ok(invalidation) if invalidation.source == own_source => {
            debug!("Ignoring own invalidation broadcast");
        }
        Ok(invalidation) => {
            let count = invalidation.apply(cache);
            debug!(kind = %invalidation.kind, from = %invalidation.source, count, "Applied remote invalidation");
        }
        Err(e) => warn!(error = %e, "Malformed invalidation message ignored"),
    }
}
