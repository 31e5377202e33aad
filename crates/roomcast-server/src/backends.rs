//! Backend selection.
//!
//! Redis and Postgres are used when their URLs are configured. Without them
//! the server falls back to in-process stores, which only work for a single
//! process.

use anyhow::{Context, Result};
use chrono::Utc;
use roomcast_core::{Backends, MemoryInviteLedger, MemoryRoomStore, MemoryWindowStore, MemoryBroker};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::redis::{self as redis_backend, RedisBroker, RedisInviteLedger, RedisSessionGate, RedisWindowStore};
use crate::repositories::PgRoomStore;

/// In-process stores that need periodic pruning.
#[derive(Default)]
pub struct Housekeeping {
    invites: Option<Arc<MemoryInviteLedger>>,
    windows: Option<Arc<MemoryWindowStore>>,
    max_window_ms: i64,
}

impl Housekeeping {
    /// Prune expired in-process records. Returns how many invites were purged.
    pub fn run(&self) -> usize {
        if let Some(windows) = &self.windows {
            windows.prune(Utc::now().timestamp_millis(), self.max_window_ms);
        }
        self.invites
            .as_ref()
            .map_or(0, |invites| invites.purge_expired())
    }
}

/// Connected backends.
pub struct Connected {
    pub backends: Backends,
    pub housekeeping: Housekeeping,
}

fn max_window_ms(config: &Config) -> i64 {
    let limits = &config.rate_limits;
    let secs = [limits.login, limits.registration, limits.api, limits.messages]
        .iter()
        .map(|rule| rule.window_secs)
        .max()
        .unwrap_or(0);
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Connect the configured backends.
///
/// # Errors
///
/// Returns an error if a configured backend cannot be reached or the
/// database migrations fail.
pub async fn connect(config: &Config) -> Result<Connected> {
    let mut housekeeping = Housekeeping {
        max_window_ms: max_window_ms(config),
        ..Housekeeping::default()
    };

    let mut backends = match &config.redis.url {
        Some(url) => {
            let (client, conn) = redis_backend::connect(url).await?;
            info!("Using Redis for invites, rate limits, sessions and fan-out");
            Backends {
                rooms: Arc::new(MemoryRoomStore::new()),
                invites: Arc::new(RedisInviteLedger::new(conn.clone())),
                broker: Arc::new(RedisBroker::new(client, conn.clone())),
                windows: Arc::new(RedisWindowStore::new(conn.clone())),
                sessions: Arc::new(RedisSessionGate::new(conn)),
            }
        }
        None => {
            warn!("No Redis configured, shared state is local to this process");
            let invites = Arc::new(MemoryInviteLedger::new());
            let windows = Arc::new(MemoryWindowStore::new());
            housekeeping.invites = Some(invites.clone());
            housekeeping.windows = Some(windows.clone());
            Backends {
                rooms: Arc::new(MemoryRoomStore::new()),
                invites,
                broker: Arc::new(MemoryBroker::default()),
                windows,
                sessions: Arc::new(config.auth.static_gate()),
            }
        }
    };

    match &config.database.url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            let store = PgRoomStore::new(pool);
            store.migrate().await.context("Failed to run migrations")?;
            info!("Using Postgres for rooms");
            backends.rooms = Arc::new(store);
        }
        None => warn!("No database configured, rooms are kept in memory"),
    }

    Ok(Connected {
        backends,
        housekeeping,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_fallback() {
        let config = Config::default();
        let connected = connect(&config).await.unwrap();
        assert!(connected.housekeeping.invites.is_some());
        assert_eq!(connected.housekeeping.run(), 0);
    }

    #[test]
    fn test_max_window_covers_longest_rule() {
        assert_eq!(max_window_ms(&Config::default()), 3_600_000);
    }
}
