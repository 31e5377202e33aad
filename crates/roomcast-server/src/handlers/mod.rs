//! HTTP and WebSocket handlers.

pub mod health;
pub mod invites;
pub mod rooms;
pub mod ws;
