//! Redis-backed shared state.
//!
//! One Redis deployment serves every server process: the invite ledger,
//! rate-limit windows, session lookups and the room event broker.

mod broker;
mod ledger;
mod sessions;
mod windows;

pub use broker::RedisBroker;
pub use ledger::RedisInviteLedger;
pub use sessions::RedisSessionGate;
pub use windows::RedisWindowStore;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

/// Open a client and a managed connection.
///
/// # Errors
///
/// Returns an error if the URL is invalid or Redis cannot be reached.
pub async fn connect(url: &str) -> Result<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(url).context("Invalid Redis URL")?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    Ok((client, manager))
}
