//! # roomcast-core
//!
//! Real-time coordination for multi-user chat rooms.
//!
//! This crate provides the building blocks shared by every server process:
//!
//! - **Registry** - Live connections on this process and their room subscriptions
//! - **Bus** - Cross-process fan-out of room events through a shared broker
//! - **Lifecycle** - Rooms, memberships, ownership succession and archival
//! - **Invites** - Expiring, usage-capped invite tokens
//! - **Rate limits** - Sliding-window limits that fail open
//! - **Hub** - Glue between transports, sessions and the services above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│ RoomService │──▶ RoomStore
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│  FanoutBus  │◀───▶ Broker (all processes)
//! └─────────────┘     └─────────────┘
//! ```

pub mod bus;
pub mod error;
pub mod hub;
pub mod invite;
pub mod lifecycle;
pub mod metrics;
pub mod ratelimit;
pub mod registry;
pub mod room;
pub mod session;
pub mod store;

pub use bus::{Broker, BrokerError, BrokerFeed, BrokerMessage, BusConfig, FanoutBus, MemoryBroker};
pub use error::{CoreError, ErrorKind, RateLimitInfo};
pub use hub::{Backends, Hub, HubConfig, HubSettings, HubStats};
pub use invite::{
    InviteConfig, InviteLedger, InviteOptions, InviteRecord, InviteService, LedgerError,
    MemoryInviteLedger, TokenValidation,
};
pub use lifecycle::{DeletedRoom, JoinOutcome, LeaveOutcome, RoomPage, RoomService, RoomView};
pub use ratelimit::{MemoryWindowStore, Policy, RateLimitConfig, RateLimiter, WindowStore};
pub use registry::{ConnectionRegistry, RegistryConfig};
pub use room::{Role, Room, RoomConfig, RoomId, RoomPatch, RoomSnapshot, RoomSpec, UserId};
pub use session::{GateError, Identity, SessionGate, StaticSessionGate};
pub use store::{MemoryRoomStore, RoomStore, StoreError};
