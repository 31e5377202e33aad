//! Session glue: ties connections, rooms, invites and the bus together.
//!
//! The [`Hub`] owns the per-process services. Transports hand it inbound
//! frames; the HTTP layer calls its room and invite operations. Every state
//! change that other users should see is published through the fan-out bus.

use chrono::Utc;
use futures_util::future::join_all;
use roomcast_protocol::codec;
use roomcast_protocol::{
    ChatMessage, ClientFrame, MemberCount, RoomUpdated, SendMessage, ServerEvent, Typing,
    UserJoined, UserLeft, UserSummary,
};
use roomcast_transport::{ConnectionId, ConnectionSink};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Broker, BusConfig, BusStats, FanoutBus, MemoryBroker};
use crate::error::{within, CoreError};
use crate::invite::{
    InviteConfig, InviteLedger, InviteOptions, InviteRecord, InviteService, MemoryInviteLedger,
    Redemption,
};
use crate::lifecycle::{DeletedRoom, JoinOutcome, LeaveOutcome, RoomService, RoomView};
use crate::metrics;
use crate::ratelimit::{MemoryWindowStore, Policy, RateLimitConfig, RateLimiter, WindowStore};
use crate::registry::{ConnectionRegistry, Departure, RegistryConfig, RegistryStats};
use crate::room::{RoomConfig, RoomId, RoomPatch, RoomSnapshot, RoomSpec, UserId};
use crate::session::{Identity, SessionGate};
use crate::store::{MemoryRoomStore, RoomStore};

/// Error code sent to clients when the server shuts down.
pub const SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";

/// Frame handling configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum chat message length in characters, after trimming.
    pub max_message_length: usize,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// Deadline for session lookups.
    pub session_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_message_length: 2_000,
            max_frame_size: codec::MAX_FRAME_SIZE,
            session_timeout: Duration::from_secs(2),
        }
    }
}

/// Shared-state backends.
#[derive(Clone)]
pub struct Backends {
    pub rooms: Arc<dyn RoomStore>,
    pub invites: Arc<dyn InviteLedger>,
    pub broker: Arc<dyn Broker>,
    pub windows: Arc<dyn WindowStore>,
    pub sessions: Arc<dyn SessionGate>,
}

impl Backends {
    /// In-process backends. Only suitable for a single process.
    #[must_use]
    pub fn in_memory(sessions: Arc<dyn SessionGate>) -> Self {
        Self {
            rooms: Arc::new(MemoryRoomStore::new()),
            invites: Arc::new(MemoryInviteLedger::new()),
            broker: Arc::new(MemoryBroker::default()),
            windows: Arc::new(MemoryWindowStore::new()),
            sessions,
        }
    }
}

/// Service settings.
#[derive(Debug, Clone, Default)]
pub struct HubSettings {
    pub rooms: RoomConfig,
    pub invites: InviteConfig,
    pub rate_limits: RateLimitConfig,
    pub registry: RegistryConfig,
    pub bus: BusConfig,
    pub hub: HubConfig,
}

/// Hub-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub node_id: String,
    pub connections: RegistryStats,
    pub bus: BusStats,
}

/// Per-process coordinator.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<FanoutBus>,
    rooms: Arc<RoomService>,
    invites: Arc<InviteService>,
    limiter: Arc<RateLimiter>,
    gate: Arc<dyn SessionGate>,
    config: HubConfig,
}

impl Hub {
    /// Wire the services over the given backends.
    #[must_use]
    pub fn build(backends: Backends, settings: HubSettings) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_config(settings.registry));
        let bus = Arc::new(FanoutBus::new(backends.broker, registry.clone(), settings.bus));
        let rooms = Arc::new(RoomService::new(
            backends.rooms,
            backends.invites.clone(),
            settings.rooms,
        ));
        let invites = Arc::new(InviteService::new(
            backends.invites,
            rooms.clone(),
            settings.invites,
        ));
        let limiter = Arc::new(RateLimiter::new(backends.windows, settings.rate_limits));

        Self {
            registry,
            bus,
            rooms,
            invites,
            limiter,
            gate: backends.sessions,
            config: settings.hub,
        }
    }

    /// Start delivering bus events to local connections.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the broker subscription fails.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, CoreError> {
        self.bus.start(shutdown).await
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomService> {
        &self.rooms
    }

    #[must_use]
    pub fn invites(&self) -> &Arc<InviteService> {
        &self.invites
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            node_id: self.bus.node_id().to_string(),
            connections: self.registry.stats(),
            bus: self.bus.stats(),
        }
    }

    // Sessions

    /// Resolve a session token.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` for a missing or unknown token, `Unavailable` if the
    /// session store fails.
    pub async fn resolve_session(&self, token: Option<&str>) -> Result<Identity, CoreError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(CoreError::Unauthenticated)?;
        within(
            self.config.session_timeout,
            "session store",
            self.gate.authenticate(token),
        )
        .await?
        .ok_or(CoreError::Unauthenticated)
    }

    // Connections

    /// Register a new transport connection.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the connection limit is reached.
    pub fn open(&self, sink: Arc<dyn ConnectionSink>) -> Result<ConnectionId, CoreError> {
        Ok(self.registry.register(sink)?)
    }

    /// Authenticate a registered connection.
    ///
    /// # Errors
    ///
    /// `Unauthenticated`, `Unavailable`, or `NotFound` for an unknown connection.
    pub async fn authenticate(&self, id: &ConnectionId, token: Option<&str>) -> Result<Identity, CoreError> {
        let identity = self.resolve_session(token).await?;
        self.registry.attach_identity(id, identity.clone())?;
        info!(connection = %id, user = identity.user_id, "Connection authenticated");
        Ok(identity)
    }

    /// Handle one inbound text frame. Failures are reported to the sender
    /// as `error` frames.
    pub async fn handle_text(&self, id: &ConnectionId, text: &str) {
        let started = Instant::now();
        self.registry.record_inbound(id);
        metrics::record_message(text.len(), "inbound");

        let result = match codec::decode_client(text, self.config.max_frame_size) {
            Ok(frame) => self.handle_frame(id, frame).await,
            Err(e) => {
                debug!(connection = %id, error = %e, "Rejected frame");
                self.reply_error(id, e.code(), &e.to_string());
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(connection = %id, error = %e, "Frame failed");
            self.reply_error(id, e.code(), &e.to_string());
        }
        metrics::record_latency(started.elapsed().as_secs_f64());
    }

    /// Handle one decoded client frame.
    ///
    /// # Errors
    ///
    /// Any error the underlying operation reports.
    pub async fn handle_frame(&self, id: &ConnectionId, frame: ClientFrame) -> Result<(), CoreError> {
        let identity = self.registry.identity(id).ok_or(CoreError::Unauthenticated)?;

        match frame {
            ClientFrame::RoomJoin(r) => self.subscribe(id, &identity, r.room_id).await,
            ClientFrame::RoomLeave(r) => {
                self.unsubscribe(id, &identity, r.room_id).await;
                Ok(())
            }
            ClientFrame::MessageSend(m) => self.send_message(id, &identity, m).await,
            ClientFrame::TypingStart(r) => self.typing(id, &identity, r.room_id, true).await,
            ClientFrame::TypingStop(r) => self.typing(id, &identity, r.room_id, false).await,
        }
    }

    async fn subscribe(&self, id: &ConnectionId, identity: &Identity, room_id: RoomId) -> Result<(), CoreError> {
        let outcome = self.rooms.request_join(room_id, identity.user_id).await?;
        let subscribed = self.registry.subscribe(id, room_id)?;

        if subscribed || outcome.joined {
            self.announce(room_id, user_joined(identity, room_id)).await;
        }
        if outcome.joined {
            self.announce(room_id, member_count(room_id, outcome.member_count))
                .await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, id: &ConnectionId, identity: &Identity, room_id: RoomId) {
        if self.registry.unsubscribe(id, room_id) {
            self.announce(room_id, user_left(identity.user_id, room_id)).await;
        }
    }

    async fn send_message(&self, id: &ConnectionId, identity: &Identity, message: SendMessage) -> Result<(), CoreError> {
        let room_id = message.room_id;
        if !self.registry.is_subscribed(id, room_id) {
            return Err(CoreError::NotMember);
        }

        let content = message.content.trim();
        if content.is_empty() {
            return Err(CoreError::invalid("Message content is required"));
        }
        if content.chars().count() > self.config.max_message_length {
            return Err(CoreError::invalid(format!(
                "Message exceeds {} characters",
                self.config.max_message_length
            )));
        }

        self.limiter
            .enforce(Policy::Messages, &format!("{}:{room_id}", identity.user_id))
            .await?;

        if !self.rooms.is_member(room_id, identity.user_id).await? {
            self.registry.unsubscribe(id, room_id);
            return Err(CoreError::NotMember);
        }

        let event = ServerEvent::MessageNew(ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        });
        self.announce(room_id, event).await;

        if let Err(e) = self.rooms.touch_activity(room_id, identity.user_id).await {
            warn!(room = %room_id, error = %e, "Failed to record room activity");
        }
        Ok(())
    }

    async fn typing(&self, id: &ConnectionId, identity: &Identity, room_id: RoomId, started: bool) -> Result<(), CoreError> {
        if !self.registry.is_subscribed(id, room_id) {
            return Err(CoreError::NotMember);
        }

        let typing = Typing {
            room_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
        };
        let event = if started {
            ServerEvent::TypingStart(typing)
        } else {
            ServerEvent::TypingStop(typing)
        };
        self.announce(room_id, event).await;
        Ok(())
    }

    /// Remove a closed connection and tell its rooms the user went offline.
    ///
    /// Safe to call more than once; only the first call has effects.
    pub async fn disconnect(&self, id: &ConnectionId) -> Option<Departure> {
        let departure = self.registry.deregister(id)?;
        self.announce_departure(&departure).await;
        debug!(connection = %id, "Connection closed");
        Some(departure)
    }

    /// Reclaim idle dead connections. Returns how many were removed.
    pub async fn reclaim_idle(&self) -> usize {
        let departures = self.registry.reclaim_idle().await;
        for departure in &departures {
            self.announce_departure(departure).await;
        }
        departures.len()
    }

    /// Close every connection with a shutdown notice.
    pub async fn shutdown(&self) -> usize {
        let notice = ServerEvent::error(SERVER_SHUTDOWN, "Server is shutting down");
        let departures = self.registry.close_all(Some(&notice)).await;
        join_all(departures.iter().map(|d| self.announce_departure(d))).await;
        info!(connections = departures.len(), "Closed all connections");
        departures.len()
    }

    async fn announce_departure(&self, departure: &Departure) {
        let Some(identity) = &departure.identity else {
            return;
        };
        for room_id in &departure.rooms {
            self.announce(*room_id, user_left(identity.user_id, *room_id))
                .await;
        }
    }

    // Room operations

    /// Create a room owned by the caller.
    ///
    /// # Errors
    ///
    /// See [`RoomService::create_room`].
    pub async fn create_room(&self, identity: &Identity, spec: RoomSpec) -> Result<RoomView, CoreError> {
        self.rooms.create_room(identity.user_id, spec).await
    }

    /// Join a room by id.
    ///
    /// # Errors
    ///
    /// See [`RoomService::request_join`].
    pub async fn join_room(&self, identity: &Identity, room_id: RoomId) -> Result<JoinOutcome, CoreError> {
        let outcome = self.rooms.request_join(room_id, identity.user_id).await?;
        if outcome.joined {
            self.announce(room_id, user_joined(identity, room_id)).await;
            self.announce(room_id, member_count(room_id, outcome.member_count))
                .await;
        }
        Ok(outcome)
    }

    /// Leave a room, dropping this process's subscriptions for the caller.
    ///
    /// # Errors
    ///
    /// See [`RoomService::leave_room`].
    pub async fn leave_room(&self, identity: &Identity, room_id: RoomId) -> Result<LeaveOutcome, CoreError> {
        let outcome = self.rooms.leave_room(room_id, identity.user_id).await?;
        self.registry.unsubscribe_user(room_id, identity.user_id);

        self.announce(room_id, user_left(identity.user_id, room_id)).await;
        self.announce(room_id, member_count(room_id, outcome.member_count))
            .await;
        if outcome.new_owner.is_some() {
            self.announce(room_id, room_updated(&outcome.room)).await;
        }
        Ok(outcome)
    }

    /// Update room fields. Owner only.
    ///
    /// # Errors
    ///
    /// See [`RoomService::update_room`].
    pub async fn update_room(&self, identity: &Identity, room_id: RoomId, patch: RoomPatch) -> Result<RoomSnapshot, CoreError> {
        let snapshot = self.rooms.update_room(room_id, identity.user_id, patch).await?;
        self.announce(room_id, room_updated(&snapshot)).await;
        Ok(snapshot)
    }

    /// Hand ownership to another member. Owner only.
    ///
    /// # Errors
    ///
    /// See [`RoomService::transfer_ownership`].
    pub async fn transfer_ownership(&self, identity: &Identity, room_id: RoomId, target: UserId) -> Result<RoomSnapshot, CoreError> {
        let snapshot = self
            .rooms
            .transfer_ownership(room_id, identity.user_id, target)
            .await?;
        self.announce(room_id, room_updated(&snapshot)).await;
        Ok(snapshot)
    }

    /// Delete a room. Owner only.
    ///
    /// # Errors
    ///
    /// See [`RoomService::delete_room`].
    pub async fn delete_room(&self, identity: &Identity, room_id: RoomId) -> Result<DeletedRoom, CoreError> {
        let deleted = self.rooms.delete_room(room_id, identity.user_id).await?;
        self.announce(
            room_id,
            ServerEvent::RoomDeleted(roomcast_protocol::RoomRef { room_id }),
        )
        .await;
        Ok(deleted)
    }

    // Invites

    /// Mint an invite. Owner only.
    ///
    /// # Errors
    ///
    /// See [`InviteService::generate_invite`].
    pub async fn generate_invite(&self, identity: &Identity, room_id: RoomId, options: InviteOptions) -> Result<InviteRecord, CoreError> {
        self.invites
            .generate_invite(room_id, identity.user_id, options)
            .await
    }

    /// Redeem an invite and announce the new member.
    ///
    /// # Errors
    ///
    /// See [`InviteService::redeem`].
    pub async fn redeem_invite(&self, identity: &Identity, token: &str) -> Result<Redemption, CoreError> {
        let redemption = self.invites.redeem(token, identity.user_id).await?;
        if redemption.joined {
            let room_id = redemption.room_id;
            self.announce(room_id, user_joined(identity, room_id)).await;
            if let Some(count) = redemption.member_count {
                self.announce(room_id, member_count(room_id, count)).await;
            }
        }
        Ok(redemption)
    }

    async fn announce(&self, room_id: RoomId, event: ServerEvent) {
        if let Err(e) = self.bus.publish(room_id, event).await {
            warn!(room = %room_id, error = %e, "Refused to publish event");
        }
    }

    fn reply_error(&self, id: &ConnectionId, code: &'static str, message: &str) {
        metrics::record_error(code);
        if let Err(e) = self.registry.send_to(id, &ServerEvent::error(code, message)) {
            debug!(connection = %id, error = %e, "Could not deliver error frame");
        }
    }
}

fn user_joined(identity: &Identity, room_id: RoomId) -> ServerEvent {
    ServerEvent::UserJoined(UserJoined {
        user: UserSummary {
            id: identity.user_id,
            username: identity.username.clone(),
        },
        room_id,
    })
}

fn user_left(user_id: UserId, room_id: RoomId) -> ServerEvent {
    ServerEvent::UserLeft(UserLeft { user_id, room_id })
}

fn member_count(room_id: RoomId, count: u32) -> ServerEvent {
    ServerEvent::MemberCountUpdated(MemberCount { room_id, count })
}

/// `room:updated` event for a snapshot.
#[must_use]
pub fn room_updated(snapshot: &RoomSnapshot) -> ServerEvent {
    let room = &snapshot.room;
    ServerEvent::RoomUpdated(RoomUpdated {
        room_id: room.id,
        name: room.name.clone(),
        description: room.description.clone(),
        is_private: room.is_private,
        capacity: room.capacity,
        owner_id: snapshot.owner_id(),
        settings: room.settings.clone(),
    })
}
