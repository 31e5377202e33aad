//! Invite ledger on Redis.
//!
//! Each invite is a hash `invite:{token}` whose key TTL is the invite lifetime
//! plus the retention grace. Tokens are indexed in the set
//! `room:{id}:invites`, whose TTL is stretched on every insert to cover its
//! longest-lived token; reading the index drops tokens whose hash has
//! expired. Usage changes run as Lua scripts so that the expiry and cap
//! checks and the increment are one atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use roomcast_core::invite::ConsumeOutcome;
use roomcast_core::{InviteLedger, InviteRecord, LedgerError, RoomId};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const PUT_SCRIPT: &str = r"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
local ttl = tonumber(ARGV[1])
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('SADD', KEYS[2], ARGV[2])
if redis.call('TTL', KEYS[2]) < ttl then
    redis.call('EXPIRE', KEYS[2], ttl)
end
return 1
";

const LIVE_TOKENS_SCRIPT: &str = r"
local live = {}
for _, token in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    if redis.call('EXISTS', ARGV[1] .. token) == 1 then
        table.insert(live, token)
    else
        redis.call('SREM', KEYS[1], token)
    end
end
return live
";

const CONSUME_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local expires_at = tonumber(redis.call('HGET', KEYS[1], 'expires_at'))
if tonumber(ARGV[1]) >= expires_at then
    return -2
end
local max_usage = redis.call('HGET', KEYS[1], 'max_usage')
local usage = tonumber(redis.call('HGET', KEYS[1], 'usage_count'))
if max_usage and usage >= tonumber(max_usage) then
    return -3
end
return redis.call('HINCRBY', KEYS[1], 'usage_count', 1)
";

const RELEASE_SCRIPT: &str = r"
local usage = tonumber(redis.call('HGET', KEYS[1], 'usage_count'))
if usage and usage > 0 then
    return redis.call('HINCRBY', KEYS[1], 'usage_count', -1)
end
return 0
";

const INVITE_PREFIX: &str = "invite:";

fn invite_key(token: &str) -> String {
    format!("{INVITE_PREFIX}{token}")
}

fn room_key(room_id: RoomId) -> String {
    format!("room:{room_id}:invites")
}

fn unavailable(err: redis::RedisError) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

/// Invite ledger shared by all processes through Redis.
#[derive(Clone)]
pub struct RedisInviteLedger {
    conn: ConnectionManager,
    put: Script,
    live_tokens: Script,
    consume: Script,
    release: Script,
}

impl RedisInviteLedger {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            put: Script::new(PUT_SCRIPT),
            live_tokens: Script::new(LIVE_TOKENS_SCRIPT),
            consume: Script::new(CONSUME_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

/// Hash fields for a record. `max_usage` is omitted when unlimited.
fn encode(record: &InviteRecord) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("room_id", record.room_id.to_string()),
        ("issuer_id", record.issuer_id.to_string()),
        ("created_at", record.created_at.timestamp_millis().to_string()),
        ("expires_at", record.expires_at.timestamp_millis().to_string()),
        ("usage_count", record.usage_count.to_string()),
    ];
    if let Some(max) = record.max_usage {
        fields.push(("max_usage", max.to_string()));
    }
    fields
}

/// `PUT_SCRIPT` arguments: TTL, token, then field/value pairs.
fn put_args(record: &InviteRecord, ttl: Duration) -> Vec<String> {
    let ttl_secs = ttl.as_secs().max(1);
    let mut args = vec![ttl_secs.to_string(), record.token.clone()];
    for (name, value) in encode(record) {
        args.push(name.to_string());
        args.push(value);
    }
    args
}

fn decode(token: &str, fields: &HashMap<String, String>) -> Result<InviteRecord, LedgerError> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, LedgerError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| LedgerError::Corrupt(format!("missing {name}")))
    }

    fn millis(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>, LedgerError> {
        field(fields, name)?
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| LedgerError::Corrupt(format!("bad {name}")))
    }

    let corrupt = |name: &str| LedgerError::Corrupt(format!("bad {name}"));

    Ok(InviteRecord {
        token: token.to_string(),
        room_id: Uuid::parse_str(field(fields, "room_id")?).map_err(|_| corrupt("room_id"))?,
        issuer_id: field(fields, "issuer_id")?
            .parse()
            .map_err(|_| corrupt("issuer_id"))?,
        created_at: millis(fields, "created_at")?,
        expires_at: millis(fields, "expires_at")?,
        usage_count: field(fields, "usage_count")?
            .parse()
            .map_err(|_| corrupt("usage_count"))?,
        max_usage: match fields.get("max_usage") {
            Some(max) => Some(max.parse().map_err(|_| corrupt("max_usage"))?),
            None => None,
        },
    })
}

fn consume_outcome(code: i64) -> ConsumeOutcome {
    match code {
        -1 => ConsumeOutcome::Missing,
        -2 => ConsumeOutcome::Expired,
        -3 => ConsumeOutcome::Exhausted,
        n => ConsumeOutcome::Consumed(u32::try_from(n).unwrap_or(u32::MAX)),
    }
}

#[async_trait]
impl InviteLedger for RedisInviteLedger {
    async fn put(&self, record: &InviteRecord, ttl: Duration) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.put.prepare_invoke();
        invocation
            .key(invite_key(&record.token))
            .key(room_key(record.room_id));
        for arg in put_args(record, ttl) {
            invocation.arg(arg);
        }

        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<InviteRecord>, LedgerError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(invite_key(token))
            .await
            .map_err(unavailable)?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode(token, &fields).map(Some)
    }

    async fn try_consume(&self, token: &str, now: DateTime<Utc>) -> Result<ConsumeOutcome, LedgerError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .consume
            .key(invite_key(token))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(consume_outcome(code))
    }

    async fn release(&self, token: &str) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(invite_key(token))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<bool, LedgerError> {
        let key = invite_key(token);
        let mut conn = self.conn.clone();

        let room_id: Option<String> = conn.hget(&key, "room_id").await.map_err(unavailable)?;
        let removed: i64 = conn.del(&key).await.map_err(unavailable)?;

        if let Some(room_id) = room_id.and_then(|r| Uuid::parse_str(&r).ok()) {
            let _: i64 = conn
                .srem(room_key(room_id), token)
                .await
                .map_err(unavailable)?;
        }
        Ok(removed > 0)
    }

    async fn tokens_for_room(&self, room_id: RoomId) -> Result<Vec<String>, LedgerError> {
        let mut conn = self.conn.clone();
        self.live_tokens
            .key(room_key(room_id))
            .arg(INVITE_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }
}
