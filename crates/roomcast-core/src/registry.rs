//! Connection registry.
//!
//! Tracks every live connection on this process, its identity and the rooms
//! it is subscribed to, and delivers room events to local subscribers.
//!
//! The connection map and the room index are never locked at the same time:
//! index updates happen after the connection entry is released, and dispatch
//! copies the recipient list before looking connections up. A stale index
//! entry left by a racing deregister is pruned on the next dispatch.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use roomcast_protocol::{codec, ServerEvent};
use roomcast_transport::{ConnectionId, ConnectionSink};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::CoreError;
use crate::metrics;
use crate::room::{RoomId, UserId};
use crate::session::Identity;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No such connection.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Connection has no identity attached.
    #[error("Connection is not authenticated")]
    Unauthenticated,

    /// Connection limit reached.
    #[error("Maximum connections reached")]
    MaxConnectionsReached,

    /// Subscription limit for one connection reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownConnection(_) => CoreError::NotFound("Connection"),
            RegistryError::Unauthenticated => CoreError::Unauthenticated,
            RegistryError::MaxConnectionsReached => {
                CoreError::Unavailable("connection limit reached".into())
            }
            RegistryError::MaxSubscriptionsReached => {
                CoreError::invalid("subscription limit reached")
            }
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum live connections on this process.
    pub max_connections: usize,
    /// Maximum rooms one connection may subscribe to.
    pub max_subscriptions_per_connection: usize,
    /// Dead connections idle longer than this are reclaimed.
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_subscriptions_per_connection: 100,
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

struct ConnectionEntry {
    sink: Arc<dyn ConnectionSink>,
    identity: Option<Identity>,
    rooms: HashSet<RoomId>,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    messages: u64,
}

/// What remains of a connection after it is deregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub identity: Option<Identity>,
    pub rooms: Vec<RoomId>,
}

/// Result of a local dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Public view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub user_id: Option<UserId>,
    pub rooms: usize,
    pub connected_at: DateTime<Utc>,
    pub messages: u64,
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_connections: usize,
    pub authenticated_connections: usize,
    pub total_connections: u64,
    pub rooms_with_subscribers: usize,
    pub total_subscriptions: usize,
    pub messages_received: u64,
    pub events_delivered: u64,
    pub dispatch_failures: u64,
    pub reclaimed_connections: u64,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    messages_received: AtomicU64,
    events_delivered: AtomicU64,
    dispatch_failures: AtomicU64,
    reclaimed: AtomicU64,
}

/// Per-process connection registry.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    counters: Counters,
    started: Instant,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating connection registry with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            counters: Counters::default(),
            started: Instant::now(),
            config,
        }
    }

    /// Record a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached.
    pub fn register(&self, sink: Arc<dyn ConnectionSink>) -> Result<ConnectionId, RegistryError> {
        if self.connections.len() >= self.config.max_connections {
            warn!(max = self.config.max_connections, "Connection limit reached");
            return Err(RegistryError::MaxConnectionsReached);
        }

        let id = sink.id().clone();
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                sink,
                identity: None,
                rooms: HashSet::new(),
                connected_at: Utc::now(),
                last_activity: Instant::now(),
                messages: 0,
            },
        );

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection();
        debug!(connection = %id, "Connection registered");
        Ok(id)
    }

    /// Attach the authenticated identity to a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn attach_identity(&self, id: &ConnectionId, identity: Identity) -> Result<(), RegistryError> {
        let mut entry = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        debug!(connection = %id, user = identity.user_id, "Identity attached");
        entry.identity = Some(identity);
        Ok(())
    }

    /// Identity attached to a connection.
    #[must_use]
    pub fn identity(&self, id: &ConnectionId) -> Option<Identity> {
        self.connections.get(id).and_then(|e| e.identity.clone())
    }

    /// Subscribe a connection to a room. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, unauthenticated, or at
    /// its subscription limit.
    pub fn subscribe(&self, id: &ConnectionId, room_id: RoomId) -> Result<bool, RegistryError> {
        {
            let mut entry = self
                .connections
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

            if entry.identity.is_none() {
                return Err(RegistryError::Unauthenticated);
            }
            if entry.rooms.contains(&room_id) {
                return Ok(false);
            }
            if entry.rooms.len() >= self.config.max_subscriptions_per_connection {
                return Err(RegistryError::MaxSubscriptionsReached);
            }
            entry.rooms.insert(room_id);
        }

        self.rooms.entry(room_id).or_default().insert(id.clone());
        metrics::record_subscription(1.0);
        debug!(connection = %id, room = %room_id, "Subscribed");
        Ok(true)
    }

    /// Unsubscribe a connection from a room. Returns `false` if it was not
    /// subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, room_id: RoomId) -> bool {
        let removed = self
            .connections
            .get_mut(id)
            .is_some_and(|mut e| e.rooms.remove(&room_id));

        if removed {
            self.unindex(room_id, id);
            metrics::record_subscription(-1.0);
            debug!(connection = %id, room = %room_id, "Unsubscribed");
        }
        removed
    }

    /// Whether a connection is subscribed to a room.
    #[must_use]
    pub fn is_subscribed(&self, id: &ConnectionId, room_id: RoomId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|e| e.rooms.contains(&room_id))
    }

    /// Note inbound activity on a connection.
    pub fn record_inbound(&self, id: &ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.last_activity = Instant::now();
            entry.messages += 1;
        }
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliver an event to every local subscriber of `room_id`.
    ///
    /// The event is encoded once. A failed send is logged and counted and
    /// does not affect the other recipients.
    pub fn dispatch_local(&self, room_id: RoomId, event: &ServerEvent) -> DispatchReport {
        let recipients: Vec<ConnectionId> = match self.rooms.get(&room_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return DispatchReport::default(),
        };

        let text: Arc<str> = match codec::encode_event(event) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(room = %room_id, error = %e, "Failed to encode event");
                return DispatchReport::default();
            }
        };

        let mut sinks = Vec::with_capacity(recipients.len());
        for id in recipients {
            let sink = self
                .connections
                .get(&id)
                .filter(|e| e.rooms.contains(&room_id))
                .map(|e| e.sink.clone());
            match sink {
                Some(sink) => sinks.push(sink),
                None => self.unindex(room_id, &id),
            }
        }

        let mut report = DispatchReport::default();
        for sink in sinks {
            match sink.send_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::record_dispatch_failure();
                    warn!(connection = %sink.id(), room = %room_id, error = %e, "Delivery failed");
                }
            }
        }

        self.counters
            .events_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .dispatch_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        metrics::record_message(text.len() * report.delivered, "outbound");
        trace!(room = %room_id, event = event.type_name(), delivered = report.delivered, "Dispatched");
        report
    }

    /// Send an event to one connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or the send fails.
    pub fn send_to(&self, id: &ConnectionId, event: &ServerEvent) -> Result<(), CoreError> {
        let sink = self
            .connections
            .get(id)
            .map(|e| e.sink.clone())
            .ok_or(CoreError::NotFound("Connection"))?;

        let text = codec::encode_event(event).map_err(|e| CoreError::invalid(e.to_string()))?;
        sink.send_text(Arc::from(text)).map_err(|e| {
            debug!(connection = %id, error = %e, "Direct send failed");
            CoreError::Unavailable(e.to_string())
        })
    }

    /// Remove a connection and all its subscriptions.
    ///
    /// Returns `None` if the connection was already removed, so callers can
    /// run departure side effects exactly once.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Departure> {
        let (_, entry) = self.connections.remove(id)?;

        let rooms: Vec<RoomId> = entry.rooms.into_iter().collect();
        for room_id in &rooms {
            self.unindex(*room_id, id);
        }

        metrics::record_disconnection();
        metrics::record_subscription(-(rooms.len() as f64));
        debug!(connection = %id, rooms = rooms.len(), "Connection deregistered");

        Some(Departure {
            connection_id: id.clone(),
            identity: entry.identity,
            rooms,
        })
    }

    /// Drop every local subscription to a room.
    pub fn drop_room(&self, room_id: RoomId) -> usize {
        let Some((_, ids)) = self.rooms.remove(&room_id) else {
            return 0;
        };

        for id in &ids {
            if let Some(mut entry) = self.connections.get_mut(id) {
                entry.rooms.remove(&room_id);
            }
        }

        metrics::record_subscription(-(ids.len() as f64));
        debug!(room = %room_id, connections = ids.len(), "Dropped room subscriptions");
        ids.len()
    }

    /// Unsubscribe every local connection of `user_id` from a room.
    pub fn unsubscribe_user(&self, room_id: RoomId, user_id: UserId) -> usize {
        self.connections_for_user(user_id)
            .iter()
            .filter(|id| self.unsubscribe(id, room_id))
            .count()
    }

    /// Local connections belonging to `user_id`.
    #[must_use]
    pub fn connections_for_user(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| e.identity.as_ref().is_some_and(|i| i.user_id == user_id))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Close and remove connections that are no longer writable and have
    /// been idle longer than the configured timeout.
    pub async fn reclaim_idle(&self) -> Vec<Departure> {
        let now = Instant::now();
        let stale: Vec<(ConnectionId, Arc<dyn ConnectionSink>)> = self
            .connections
            .iter()
            .filter(|e| {
                !e.sink.is_writable()
                    && now.duration_since(e.last_activity) > self.config.idle_timeout
            })
            .map(|e| (e.key().clone(), e.sink.clone()))
            .collect();

        let mut departures = Vec::with_capacity(stale.len());
        for (id, sink) in stale {
            if let Err(e) = sink.close(None).await {
                debug!(connection = %id, error = %e, "Close failed during reclaim");
            }
            if let Some(departure) = self.deregister(&id) {
                departures.push(departure);
            }
        }

        if !departures.is_empty() {
            self.counters
                .reclaimed
                .fetch_add(departures.len() as u64, Ordering::Relaxed);
            metrics::record_reclaimed(departures.len());
            info!(count = departures.len(), "Reclaimed idle connections");
        }
        departures
    }

    /// Close every connection, sending `notice` first, and remove them.
    ///
    /// Closes run concurrently, so the total time is that of the slowest
    /// sink rather than the sum over all of them.
    pub async fn close_all(&self, notice: Option<&ServerEvent>) -> Vec<Departure> {
        let notice: Option<Arc<str>> = notice
            .and_then(|event| codec::encode_event(event).ok())
            .map(Arc::from);

        let sinks: Vec<(ConnectionId, Arc<dyn ConnectionSink>)> = self
            .connections
            .iter()
            .map(|e| (e.key().clone(), e.sink.clone()))
            .collect();

        join_all(sinks.iter().map(|(id, sink)| {
            let notice = notice.clone();
            async move {
                if let Err(e) = sink.close(notice).await {
                    debug!(connection = %id, error = %e, "Close failed during shutdown");
                }
            }
        }))
        .await;

        sinks
            .iter()
            .filter_map(|(id, _)| self.deregister(id))
            .collect()
    }

    /// Number of local subscribers of a room.
    #[must_use]
    pub fn subscriber_count(&self, room_id: RoomId) -> usize {
        self.rooms.get(&room_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live connections, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|e| ConnectionInfo {
                id: e.key().to_string(),
                user_id: e.identity.as_ref().map(|i| i.user_id),
                rooms: e.rooms.len(),
                connected_at: e.connected_at,
                messages: e.messages,
            })
            .collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        list
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_connections: self.connections.len(),
            authenticated_connections: self
                .connections
                .iter()
                .filter(|e| e.identity.is_some())
                .count(),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            rooms_with_subscribers: self.rooms.len(),
            total_subscriptions: self.rooms.iter().map(|s| s.len()).sum(),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            events_delivered: self.counters.events_delivered.load(Ordering::Relaxed),
            dispatch_failures: self.counters.dispatch_failures.load(Ordering::Relaxed),
            reclaimed_connections: self.counters.reclaimed.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    fn unindex(&self, room_id: RoomId, id: &ConnectionId) {
        if let Some(mut ids) = self.rooms.get_mut(&room_id) {
            ids.remove(id);
        }
        self.rooms.remove_if(&room_id, |_, ids| ids.is_empty());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
