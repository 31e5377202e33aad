//! Cross-process fan-out.
//!
//! Room events are published to a shared [`Broker`] on a per-room channel.
//! Every process, the publisher included, receives them on its feed and hands
//! them to its local [`ConnectionRegistry`], so all subscribers see the same
//! per-room order. Delivery is best-effort: broker failures are logged and
//! counted, never retried.

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_protocol::codec::{self, BusEnvelope};
use roomcast_protocol::ServerEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::metrics;
use crate::registry::{ConnectionRegistry, DispatchReport};
use crate::room::RoomId;

/// Channel name prefix for room events.
pub const ROOM_CHANNEL_PREFIX: &str = "roomcast:room:";

/// Pattern matching every room channel.
pub const ROOM_CHANNEL_PATTERN: &str = "roomcast:room:*";

/// Default feed buffer between the broker and the listener.
pub const DEFAULT_FEED_CAPACITY: usize = 4096;

/// Channel carrying events for `room_id`.
#[must_use]
pub fn room_channel(room_id: RoomId) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room_id}")
}

/// Room id from a room channel name.
#[must_use]
pub fn parse_room_channel(channel: &str) -> Option<RoomId> {
    channel
        .strip_prefix(ROOM_CHANNEL_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The subscription was lost.
    #[error("Broker subscription closed")]
    Closed,
}

impl From<BrokerError> for CoreError {
    fn from(err: BrokerError) -> Self {
        CoreError::Unavailable(err.to_string())
    }
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Messages from every room channel, in broker order.
#[derive(Debug)]
pub struct BrokerFeed {
    rx: mpsc::Receiver<BrokerMessage>,
}

impl BrokerFeed {
    /// A feed and the sender that fills it.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<BrokerMessage>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Next message, or `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

/// Shared publish/subscribe broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to every room channel.
    async fn subscribe(&self) -> Result<BrokerFeed, BrokerError>;
}

/// In-process broker.
///
/// Clones share one bus, so each clone can stand in for a separate server
/// process.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
    available: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Create a new broker with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: publishes fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".into()));
        }

        // No subscribers is not an error.
        let _ = self.tx.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<BrokerFeed, BrokerError> {
        let mut rx = self.tx.subscribe();
        let (feed_tx, feed) = BrokerFeed::channel(DEFAULT_FEED_CAPACITY);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if !message.channel.starts_with(ROOM_CHANNEL_PREFIX) {
                            continue;
                        }
                        if feed_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(feed)
    }
}

/// Fan-out bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Identifies this process in published envelopes.
    pub node_id: String,
    /// Deadline for one broker publish.
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4().simple()),
            publish_timeout: Duration::from_secs(2),
        }
    }
}

/// Bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub decode_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    decode_failures: AtomicU64,
}

/// Publishes room events and delivers received ones locally.
pub struct FanoutBus {
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    config: BusConfig,
    counters: Counters,
}

impl FanoutBus {
    /// Create a new bus.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<ConnectionRegistry>, config: BusConfig) -> Self {
        Self {
            broker,
            registry,
            config,
            counters: Counters::default(),
        }
    }

    /// This process's node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Publish an event on its room's channel.
    ///
    /// Returns `false` if the broker rejected or timed out the publish.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the event does not belong to `room_id`.
    pub async fn publish(&self, room_id: RoomId, event: ServerEvent) -> Result<bool, CoreError> {
        event.validate_for(room_id).map_err(CoreError::invalid)?;

        let kind = event.type_name();
        let envelope = BusEnvelope::new(self.config.node_id.clone(), room_id, event);
        let payload = codec::encode_envelope(&envelope).map_err(|e| CoreError::invalid(e.to_string()))?;
        let channel = room_channel(room_id);

        let failure = match tokio::time::timeout(
            self.config.publish_timeout,
            self.broker.publish(&channel, payload),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("publish timed out".to_string()),
        };

        if let Some(reason) = failure {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_bus_failure("publish");
            warn!(room = %room_id, event = kind, error = %reason, "Broker publish failed");
            return Ok(false);
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::record_bus_published(kind);
        trace!(room = %room_id, event = kind, "Published");
        Ok(true)
    }

    /// Deliver one broker message to local subscribers.
    ///
    /// A `room:deleted` event also drops every local subscription to the room.
    pub fn deliver(&self, message: &BrokerMessage) -> Option<DispatchReport> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::record_bus_received();

        let Some(room_id) = parse_room_channel(&message.channel) else {
            debug!(channel = %message.channel, "Ignoring non-room channel");
            return None;
        };

        let envelope = match codec::decode_envelope(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_bus_failure("decode");
                warn!(room = %room_id, error = %e, "Dropping undecodable bus message");
                return None;
            }
        };

        if envelope.room_id != room_id || envelope.event.validate_for(room_id).is_err() {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_bus_failure("decode");
            warn!(room = %room_id, origin = %envelope.origin, "Dropping event published on the wrong channel");
            return None;
        }

        let report = self.registry.dispatch_local(room_id, &envelope.event);
        if matches!(envelope.event, ServerEvent::RoomDeleted(_)) {
            self.registry.drop_room(room_id);
        }
        Some(report)
    }

    /// Subscribe to the broker and spawn the listener.
    ///
    /// The listener handles messages one at a time, preserving broker order,
    /// until `shutdown` flips to `true` or the feed ends.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the subscription cannot be established.
    pub async fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, CoreError> {
        let mut feed = self.broker.subscribe().await?;
        let bus = Arc::clone(self);

        info!(node = %self.config.node_id, pattern = ROOM_CHANNEL_PATTERN, "Fan-out bus subscribed");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = feed.recv() => match message {
                        Some(message) => {
                            bus.deliver(&message);
                        }
                        None => {
                            warn!("Broker feed closed, fan-out listener stopping");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Fan-out listener shutting down");
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Identity;
    use roomcast_protocol::{MemberCount, RoomRef};
    use roomcast_transport::{queued, ConnectionId, Outbound, OutboundQueue};

    fn subscriber(registry: &ConnectionRegistry, name: &str, room: RoomId) -> (ConnectionId, OutboundQueue) {
        let (sink, queue) = queued(ConnectionId::new(name), 16);
        let id = registry.register(Arc::new(sink)).unwrap();
        registry.attach_identity(&id, Identity::new(1, "alice")).unwrap();
        registry.subscribe(&id, room).unwrap();
        (id, queue)
    }

    async fn next_text(queue: &mut OutboundQueue) -> String {
        match tokio::time::timeout(Duration::from_secs(1), queue.next()).await {
            Ok(Some(Outbound::Text(text))) => text.to_string(),
            other => panic!("Expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_room_channel_roundtrip() {
        let room = Uuid::new_v4();
        assert_eq!(parse_room_channel(&room_channel(room)), Some(room));
        assert_eq!(parse_room_channel("other:channel"), None);
    }

    #[tokio::test]
    async fn test_publish_rejects_mismatched_room() {
        let bus = FanoutBus::new(
            Arc::new(MemoryBroker::default()),
            Arc::new(ConnectionRegistry::new()),
            BusConfig::default(),
        );
        let event = ServerEvent::MemberCountUpdated(MemberCount {
            room_id: Uuid::new_v4(),
            count: 1,
        });

        assert!(matches!(
            bus.publish(Uuid::new_v4(), event).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_not_raised() {
        let broker = MemoryBroker::default();
        broker.set_available(false);
        let bus = FanoutBus::new(Arc::new(broker), Arc::new(ConnectionRegistry::new()), BusConfig::default());
        let room = Uuid::new_v4();

        let ok = bus
            .publish(room, ServerEvent::RoomDeleted(RoomRef { room_id: room }))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(bus.stats().publish_failures, 1);
    }

    #[tokio::test]
    async fn test_events_reach_other_process() {
        let broker = MemoryBroker::default();
        let (_tx, shutdown) = watch::channel(false);
        let room = Uuid::new_v4();

        let registry_a = Arc::new(ConnectionRegistry::new());
        let registry_b = Arc::new(ConnectionRegistry::new());
        let bus_a = Arc::new(FanoutBus::new(Arc::new(broker.clone()), registry_a.clone(), BusConfig::default()));
        let bus_b = Arc::new(FanoutBus::new(Arc::new(broker.clone()), registry_b.clone(), BusConfig::default()));
        bus_a.start(shutdown.clone()).await.unwrap();
        bus_b.start(shutdown.clone()).await.unwrap();

        let (_a, mut qa) = subscriber(&registry_a, "a", room);
        let (_b, mut qb) = subscriber(&registry_b, "b", room);

        bus_a
            .publish(room, ServerEvent::MemberCountUpdated(MemberCount { room_id: room, count: 3 }))
            .await
            .unwrap();

        assert!(next_text(&mut qa).await.contains("room:member_count_updated"));
        assert!(next_text(&mut qb).await.contains("room:member_count_updated"));
    }

    #[tokio::test]
    async fn test_room_deleted_drops_subscriptions() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = FanoutBus::new(Arc::new(MemoryBroker::default()), registry.clone(), BusConfig::default());
        let room = Uuid::new_v4();
        let (id, mut queue) = subscriber(&registry, "a", room);

        let envelope = BusEnvelope::new("node-x", room, ServerEvent::RoomDeleted(RoomRef { room_id: room }));
        let message = BrokerMessage {
            channel: room_channel(room),
            payload: codec::encode_envelope(&envelope).unwrap(),
        };

        let report = bus.deliver(&message).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(next_text(&mut queue).await.contains("room:deleted"));
        assert!(!registry.is_subscribed(&id, room));
    }

    #[tokio::test]
    async fn test_deliver_drops_garbage() {
        let bus = FanoutBus::new(
            Arc::new(MemoryBroker::default()),
            Arc::new(ConnectionRegistry::new()),
            BusConfig::default(),
        );
        let message = BrokerMessage {
            channel: room_channel(Uuid::new_v4()),
            payload: Bytes::from_static(b"\xc1garbage"),
        };

        assert!(bus.deliver(&message).is_none());
        assert_eq!(bus.stats().decode_failures, 1);
    }
}
