//! Sliding-log rate limit windows on Redis sorted sets.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use roomcast_core::ratelimit::{WindowDecision, WindowError};
use roomcast_core::WindowStore;
use uuid::Uuid;

/// Trim, count, conditionally add, and report the oldest entry, atomically.
const ACQUIRE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < max then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    count = count + 1
    allowed = 1
end
redis.call('PEXPIRE', KEYS[1], window)
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
    oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
";

/// Rate limit windows shared by all processes.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    acquire: Script,
}

impl RedisWindowStore {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            acquire: Script::new(ACQUIRE_SCRIPT),
        }
    }
}

fn decision(reply: &[i64]) -> Result<WindowDecision, WindowError> {
    match reply {
        [allowed, count, oldest] => Ok(WindowDecision {
            allowed: *allowed == 1,
            count: u32::try_from(*count).unwrap_or(u32::MAX),
            oldest_ms: (*oldest >= 0).then_some(*oldest),
        }),
        other => Err(WindowError::Unavailable(format!(
            "unexpected script reply of {} values",
            other.len()
        ))),
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn acquire(&self, key: &str, now_ms: i64, window_ms: i64, max: u32) -> Result<WindowDecision, WindowError> {
        let mut conn = self.conn.clone();
        // Members must be unique even when two requests share a millisecond.
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());

        let reply: Vec<i64> = self
            .acquire
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(max)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| WindowError::Unavailable(e.to_string()))?;

        decision(&reply)
    }

    async fn reset(&self, key: &str) -> Result<(), WindowError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(key)
            .await
            .map_err(|e| WindowError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_reply() {
        let allowed = decision(&[1, 3, 1_000]).unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.count, 3);
        assert_eq!(allowed.oldest_ms, Some(1_000));

        let limited = decision(&[0, 5, -1]).unwrap();
        assert!(!limited.allowed);
        assert_eq!(limited.oldest_ms, None);
    }

    #[test]
    fn test_decision_rejects_short_reply() {
        assert!(decision(&[1]).is_err());
    }
}
