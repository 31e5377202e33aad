//! Invite tokens.
//!
//! Tokens live in an [`InviteLedger`] shared by all server processes. A
//! record is kept for a grace period past its expiry so that late
//! redemptions can be told "expired" rather than "not found".

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{within, CoreError};
use crate::lifecycle::{JoinOutcome, RoomService};
use crate::metrics;
use crate::room::{Role, RoomId, UserId};

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 32;

/// Invite ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The backend could not be reached.
    #[error("Invite ledger unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("Corrupt invite record: {0}")]
    Corrupt(String),
}

impl From<LedgerError> for CoreError {
    fn from(err: LedgerError) -> Self {
        CoreError::Unavailable(err.to_string())
    }
}

/// A stored invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub token: String,
    pub room_id: RoomId,
    pub issuer_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: u32,
    /// `None` means unlimited.
    pub max_usage: Option<u32>,
}

impl InviteRecord {
    /// Why the invite cannot be used at `now`, if it cannot.
    #[must_use]
    pub fn check(&self, now: DateTime<Utc>) -> Option<InvalidReason> {
        if now >= self.expires_at {
            return Some(InvalidReason::Expired);
        }
        if self.max_usage.is_some_and(|max| self.usage_count >= max) {
            return Some(InvalidReason::UsageExceeded);
        }
        None
    }
}

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    NotFound,
    Expired,
    UsageExceeded,
}

impl InvalidReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::NotFound => "not_found",
            InvalidReason::Expired => "expired",
            InvalidReason::UsageExceeded => "usage_exceeded",
        }
    }

    fn into_error(self) -> CoreError {
        match self {
            InvalidReason::NotFound => CoreError::NotFound("Invite"),
            InvalidReason::Expired => CoreError::Expired,
            InvalidReason::UsageExceeded => CoreError::UsageExceeded,
        }
    }
}

/// Result of validating a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidation {
    Valid(InviteRecord),
    Invalid(InvalidReason),
}

/// Result of an atomic usage increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Usage incremented to the contained count.
    Consumed(u32),
    /// Usage already at the cap; nothing changed.
    Exhausted,
    /// Past its expiry; nothing changed.
    Expired,
    /// No such token.
    Missing,
}

/// Shared, expiring store of invite records indexed by room.
#[async_trait]
pub trait InviteLedger: Send + Sync {
    /// Store a record, retained for `ttl`, and index it under its room.
    async fn put(&self, record: &InviteRecord, ttl: Duration) -> Result<(), LedgerError>;

    /// Fetch a record.
    async fn get(&self, token: &str) -> Result<Option<InviteRecord>, LedgerError>;

    /// Atomically check expiry and cap, then increment usage.
    async fn try_consume(&self, token: &str, now: DateTime<Utc>) -> Result<ConsumeOutcome, LedgerError>;

    /// Undo one increment after a failed join. Never goes below zero.
    async fn release(&self, token: &str) -> Result<(), LedgerError>;

    /// Remove a record and its index entry. Returns whether it existed.
    async fn delete(&self, token: &str) -> Result<bool, LedgerError>;

    /// Live tokens indexed under `room_id`. Index entries whose record is
    /// gone are dropped from the index.
    async fn tokens_for_room(&self, room_id: RoomId) -> Result<Vec<String>, LedgerError>;
}

/// Delete every token indexed under `room_id`. Returns how many existed.
///
/// # Errors
///
/// Returns `Unavailable` if the ledger fails or times out.
pub async fn revoke_room_tokens(
    ledger: &dyn InviteLedger,
    room_id: RoomId,
    timeout: Duration,
) -> Result<usize, CoreError> {
    let tokens = within(timeout, "invite ledger", ledger.tokens_for_room(room_id)).await?;

    let mut revoked = 0;
    for token in &tokens {
        if within(timeout, "invite ledger", ledger.delete(token)).await? {
            revoked += 1;
        }
    }

    if revoked > 0 {
        metrics::record_invites_revoked(revoked);
        debug!(room = %room_id, revoked, "Revoked room invites");
    }
    Ok(revoked)
}

/// Generate a token: 32 random bytes, hex encoded.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct StoredInvite {
    record: InviteRecord,
    evict_at: Instant,
}

/// In-process invite ledger.
#[derive(Default)]
pub struct MemoryInviteLedger {
    invites: DashMap<String, StoredInvite>,
    rooms: DashMap<RoomId, HashSet<String>>,
}

impl MemoryInviteLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop records whose retention has elapsed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<(String, RoomId)> = self
            .invites
            .iter()
            .filter(|e| e.evict_at <= now)
            .map(|e| (e.key().clone(), e.record.room_id))
            .collect();

        for (token, room_id) in &stale {
            self.invites.remove(token);
            self.unindex(*room_id, token);
        }
        stale.len()
    }

    fn unindex(&self, room_id: RoomId, token: &str) {
        if let Some(mut set) = self.rooms.get_mut(&room_id) {
            set.remove(token);
        }
        self.rooms.remove_if(&room_id, |_, set| set.is_empty());
    }

    fn live(&self, token: &str) -> Option<InviteRecord> {
        let entry = self.invites.get(token)?;
        if entry.evict_at <= Instant::now() {
            let room_id = entry.record.room_id;
            drop(entry);
            self.invites.remove(token);
            self.unindex(room_id, token);
            return None;
        }
        Some(entry.record.clone())
    }
}

#[async_trait]
impl InviteLedger for MemoryInviteLedger {
    async fn put(&self, record: &InviteRecord, ttl: Duration) -> Result<(), LedgerError> {
        self.invites.insert(
            record.token.clone(),
            StoredInvite {
                record: record.clone(),
                evict_at: Instant::now() + ttl,
            },
        );
        self.rooms
            .entry(record.room_id)
            .or_default()
            .insert(record.token.clone());
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<InviteRecord>, LedgerError> {
        Ok(self.live(token))
    }

    async fn try_consume(&self, token: &str, now: DateTime<Utc>) -> Result<ConsumeOutcome, LedgerError> {
        if self.live(token).is_none() {
            return Ok(ConsumeOutcome::Missing);
        }
        let Some(mut entry) = self.invites.get_mut(token) else {
            return Ok(ConsumeOutcome::Missing);
        };

        let record = &mut entry.record;
        Ok(match record.check(now) {
            Some(InvalidReason::Expired) => ConsumeOutcome::Expired,
            Some(_) => ConsumeOutcome::Exhausted,
            None => {
                record.usage_count += 1;
                ConsumeOutcome::Consumed(record.usage_count)
            }
        })
    }

    async fn release(&self, token: &str) -> Result<(), LedgerError> {
        if let Some(mut entry) = self.invites.get_mut(token) {
            entry.record.usage_count = entry.record.usage_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<bool, LedgerError> {
        match self.invites.remove(token) {
            Some((_, stored)) => {
                self.unindex(stored.record.room_id, token);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn tokens_for_room(&self, room_id: RoomId) -> Result<Vec<String>, LedgerError> {
        let indexed: Vec<String> = self
            .rooms
            .get(&room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        Ok(indexed
            .into_iter()
            .filter(|token| {
                let live = self.live(token).is_some();
                if !live {
                    self.unindex(room_id, token);
                }
                live
            })
            .collect())
    }
}

/// Invite service configuration.
#[derive(Debug, Clone)]
pub struct InviteConfig {
    /// Lifetime when none is requested.
    pub default_ttl: Duration,
    /// Shortest allowed lifetime.
    pub min_ttl: Duration,
    /// Longest allowed lifetime.
    pub max_ttl: Duration,
    /// Largest allowed usage cap.
    pub max_usage_limit: u32,
    /// How long records are retained past expiry.
    pub retention_grace: Duration,
    /// Deadline for each ledger call.
    pub ledger_timeout: Duration,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(86_400),
            min_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(7 * 86_400),
            max_usage_limit: 100,
            retention_grace: Duration::from_secs(3_600),
            ledger_timeout: Duration::from_secs(2),
        }
    }
}

/// Invite generation parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteOptions {
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Usage cap; `None` is unlimited.
    #[serde(default)]
    pub max_usage: Option<u32>,
}

/// Result of a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub room_id: RoomId,
    /// `false` if the user was already a member.
    pub joined: bool,
    pub member_count: Option<u32>,
}

/// Invite service.
pub struct InviteService {
    ledger: Arc<dyn InviteLedger>,
    rooms: Arc<RoomService>,
    config: InviteConfig,
}

impl InviteService {
    /// Create a new invite service.
    #[must_use]
    pub fn new(ledger: Arc<dyn InviteLedger>, rooms: Arc<RoomService>, config: InviteConfig) -> Self {
        Self {
            ledger,
            rooms,
            config,
        }
    }

    /// Mint a token for `room_id`. Owner only.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for out-of-range options, `NotFound`, `NotOwner`, or
    /// `Unavailable`.
    #[instrument(skip(self, options), fields(room = %room_id))]
    pub async fn generate_invite(
        &self,
        room_id: RoomId,
        issuer: UserId,
        options: InviteOptions,
    ) -> Result<InviteRecord, CoreError> {
        let ttl = options
            .expires_in
            .map_or(self.config.default_ttl, Duration::from_secs);
        if ttl < self.config.min_ttl || ttl > self.config.max_ttl {
            return Err(CoreError::invalid(format!(
                "expiresIn must be between {} and {} seconds",
                self.config.min_ttl.as_secs(),
                self.config.max_ttl.as_secs()
            )));
        }
        if let Some(max) = options.max_usage {
            if max == 0 || max > self.config.max_usage_limit {
                return Err(CoreError::invalid(format!(
                    "maxUsage must be between 1 and {}",
                    self.config.max_usage_limit
                )));
            }
        }

        match self.rooms.member_role(room_id, issuer).await? {
            Some(Role::Owner) => {}
            _ => return Err(CoreError::NotOwner),
        }

        let now = Utc::now();
        let record = InviteRecord {
            token: generate_token(),
            room_id,
            issuer_id: issuer,
            created_at: now,
            expires_at: now + to_chrono(ttl),
            usage_count: 0,
            max_usage: options.max_usage,
        };

        self.call(self.ledger.put(&record, ttl + self.config.retention_grace))
            .await?;

        metrics::record_invite_generated();
        info!(issuer, expires_at = %record.expires_at, max_usage = ?record.max_usage, "Invite generated");
        Ok(record)
    }

    /// Check a token without consuming it.
    ///
    /// Expired records are deleted as they are found.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the ledger fails.
    pub async fn validate_token(&self, token: &str) -> Result<TokenValidation, CoreError> {
        let Some(record) = self.call(self.ledger.get(token)).await? else {
            return Ok(TokenValidation::Invalid(InvalidReason::NotFound));
        };

        match record.check(Utc::now()) {
            None => Ok(TokenValidation::Valid(record)),
            Some(InvalidReason::Expired) => {
                if let Err(e) = self.call(self.ledger.delete(token)).await {
                    warn!(error = %e, "Failed to delete expired invite");
                }
                Ok(TokenValidation::Invalid(InvalidReason::Expired))
            }
            Some(reason) => Ok(TokenValidation::Invalid(reason)),
        }
    }

    /// Redeem a token and join its room.
    ///
    /// Existing members are reported as already joined and use no quota.
    /// If the join fails after the usage was counted, the count is released.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Expired`, `UsageExceeded`, `Full`, or `Unavailable`.
    #[instrument(skip(self, token))]
    pub async fn redeem(&self, token: &str, user: UserId) -> Result<Redemption, CoreError> {
        let record = match self.validate_token(token).await? {
            TokenValidation::Valid(record) => record,
            TokenValidation::Invalid(reason) => {
                metrics::record_invite_rejected(reason.as_str());
                return Err(reason.into_error());
            }
        };
        let room_id = record.room_id;

        if self.rooms.is_member(room_id, user).await? {
            return Ok(Redemption {
                room_id,
                joined: false,
                member_count: None,
            });
        }

        match self.call(self.ledger.try_consume(token, Utc::now())).await? {
            ConsumeOutcome::Consumed(_) => {}
            ConsumeOutcome::Exhausted => return Err(CoreError::UsageExceeded),
            ConsumeOutcome::Expired => return Err(CoreError::Expired),
            ConsumeOutcome::Missing => return Err(CoreError::NotFound("Invite")),
        }

        match self.rooms.join_room(room_id, user).await {
            Ok(JoinOutcome {
                joined: true,
                member_count,
                ..
            }) => {
                metrics::record_invite_redeemed();
                info!(room = %room_id, "Invite redeemed");
                Ok(Redemption {
                    room_id,
                    joined: true,
                    member_count: Some(member_count),
                })
            }
            Ok(outcome) => {
                // Joined concurrently through another path.
                self.release(token).await;
                Ok(Redemption {
                    room_id,
                    joined: false,
                    member_count: Some(outcome.member_count),
                })
            }
            Err(e) => {
                self.release(token).await;
                Err(e)
            }
        }
    }

    /// Revoke one token. Room owner only.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotOwner`, or `Unavailable`.
    pub async fn revoke(&self, token: &str, requester: UserId) -> Result<(), CoreError> {
        let record = self
            .call(self.ledger.get(token))
            .await?
            .ok_or(CoreError::NotFound("Invite"))?;

        match self.rooms.member_role(record.room_id, requester).await? {
            Some(Role::Owner) => {}
            _ => return Err(CoreError::NotOwner),
        }

        self.call(self.ledger.delete(token)).await?;
        metrics::record_invites_revoked(1);
        Ok(())
    }

    /// Revoke every token for a room.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the ledger fails.
    pub async fn revoke_all(&self, room_id: RoomId) -> Result<usize, CoreError> {
        revoke_room_tokens(&*self.ledger, room_id, self.config.ledger_timeout).await
    }

    /// Unexpired invites for a room, newest first. Owner only.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotOwner`, or `Unavailable`.
    pub async fn list_invites(&self, room_id: RoomId, requester: UserId) -> Result<Vec<InviteRecord>, CoreError> {
        match self.rooms.member_role(room_id, requester).await? {
            Some(Role::Owner) => {}
            _ => return Err(CoreError::NotOwner),
        }

        let tokens = self.call(self.ledger.tokens_for_room(room_id)).await?;
        let now = Utc::now();
        let mut invites = Vec::with_capacity(tokens.len());
        for token in tokens {
            if let Some(record) = self.call(self.ledger.get(&token)).await? {
                if record.expires_at > now {
                    invites.push(record);
                }
            }
        }

        invites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invites)
    }

    async fn release(&self, token: &str) {
        if let Err(e) = self.call(self.ledger.release(token)).await {
            warn!(error = %e, "Failed to release invite usage");
        }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, CoreError> {
        within(self.config.ledger_timeout, "invite ledger", fut).await
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(d.as_secs()).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{RoomConfig, RoomSpec};
    use crate::store::MemoryRoomStore;

    struct Fixture {
        rooms: Arc<RoomService>,
        invites: InviteService,
        ledger: Arc<MemoryInviteLedger>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryInviteLedger::new());
        let rooms = Arc::new(RoomService::new(
            Arc::new(MemoryRoomStore::new()),
            ledger.clone(),
            RoomConfig::default(),
        ));
        let invites = InviteService::new(ledger.clone(), rooms.clone(), InviteConfig::default());
        Fixture {
            rooms,
            invites,
            ledger,
        }
    }

    async fn private_room(f: &Fixture, capacity: u32) -> RoomId {
        f.rooms
            .create_room(
                1,
                RoomSpec {
                    name: "secret".into(),
                    is_private: true,
                    capacity: Some(capacity),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .room
            .id
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn test_generate_bounds_and_owner_only() {
        let f = fixture();
        let room = private_room(&f, 10).await;

        let too_short = InviteOptions {
            expires_in: Some(60),
            max_usage: None,
        };
        assert!(matches!(
            f.invites.generate_invite(room, 1, too_short).await,
            Err(CoreError::InvalidInput(_))
        ));

        let zero_uses = InviteOptions {
            expires_in: None,
            max_usage: Some(0),
        };
        assert!(matches!(
            f.invites.generate_invite(room, 1, zero_uses).await,
            Err(CoreError::InvalidInput(_))
        ));

        assert_eq!(
            f.invites
                .generate_invite(room, 2, InviteOptions::default())
                .await
                .unwrap_err(),
            CoreError::NotOwner
        );

        let record = f
            .invites
            .generate_invite(room, 1, InviteOptions::default())
            .await
            .unwrap();
        assert_eq!(record.expires_at - record.created_at, ChronoDuration::seconds(86_400));
        assert_eq!(record.usage_count, 0);
    }

    #[tokio::test]
    async fn test_redeem_respects_usage_cap() {
        let f = fixture();
        let room = private_room(&f, 10).await;
        let invite = f
            .invites
            .generate_invite(
                room,
                1,
                InviteOptions {
                    expires_in: None,
                    max_usage: Some(2),
                },
            )
            .await
            .unwrap();

        let x = f.invites.redeem(&invite.token, 10).await.unwrap();
        assert!(x.joined);
        let again = f.invites.redeem(&invite.token, 10).await.unwrap();
        assert!(!again.joined);
        assert!(f.invites.redeem(&invite.token, 11).await.unwrap().joined);
        assert_eq!(
            f.invites.redeem(&invite.token, 12).await.unwrap_err(),
            CoreError::UsageExceeded
        );

        let stored = f.ledger.get(&invite.token).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 2);
    }

    #[tokio::test]
    async fn test_failed_join_releases_usage() {
        let f = fixture();
        let room = private_room(&f, 2).await;
        let invite = f
            .invites
            .generate_invite(room, 1, InviteOptions::default())
            .await
            .unwrap();

        f.invites.redeem(&invite.token, 10).await.unwrap();
        assert_eq!(
            f.invites.redeem(&invite.token, 11).await.unwrap_err(),
            CoreError::Full
        );

        let stored = f.ledger.get(&invite.token).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 1);
    }

    #[tokio::test]
    async fn test_validate_expired_then_not_found() {
        let f = fixture();
        let room = private_room(&f, 10).await;
        let now = Utc::now();
        let record = InviteRecord {
            token: generate_token(),
            room_id: room,
            issuer_id: 1,
            created_at: now - ChronoDuration::seconds(600),
            expires_at: now - ChronoDuration::seconds(1),
            usage_count: 0,
            max_usage: None,
        };
        f.ledger.put(&record, Duration::from_secs(3_600)).await.unwrap();

        assert_eq!(
            f.invites.validate_token(&record.token).await.unwrap(),
            TokenValidation::Invalid(InvalidReason::Expired)
        );
        assert_eq!(
            f.invites.validate_token(&record.token).await.unwrap(),
            TokenValidation::Invalid(InvalidReason::NotFound)
        );
    }

    #[tokio::test]
    async fn test_delete_room_revokes_tokens() {
        let f = fixture();
        let room = private_room(&f, 10).await;
        let invite = f
            .invites
            .generate_invite(room, 1, InviteOptions::default())
            .await
            .unwrap();

        let deleted = f.rooms.delete_room(room, 1).await.unwrap();
        assert_eq!(deleted.revoked_invites, 1);
        assert_eq!(
            f.invites.redeem(&invite.token, 10).await.unwrap_err(),
            CoreError::NotFound("Invite")
        );
    }

    #[tokio::test]
    async fn test_revoke_and_list() {
        let f = fixture();
        let room = private_room(&f, 10).await;
        let a = f
            .invites
            .generate_invite(room, 1, InviteOptions::default())
            .await
            .unwrap();
        f.invites
            .generate_invite(room, 1, InviteOptions::default())
            .await
            .unwrap();

        assert_eq!(f.invites.list_invites(room, 1).await.unwrap().len(), 2);
        assert_eq!(f.invites.revoke(&a.token, 2).await.unwrap_err(), CoreError::NotOwner);

        f.invites.revoke(&a.token, 1).await.unwrap();
        assert_eq!(f.invites.list_invites(room, 1).await.unwrap().len(), 1);
        assert_eq!(f.invites.revoke_all(room).await.unwrap(), 1);
        assert!(f.invites.list_invites(room, 1).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ledger_evicts_after_ttl() {
        let ledger = MemoryInviteLedger::new();
        let now = Utc::now();
        let record = InviteRecord {
            token: "t".into(),
            room_id: uuid::Uuid::new_v4(),
            issuer_id: 1,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(60),
            usage_count: 0,
            max_usage: Some(1),
        };
        ledger.put(&record, Duration::from_secs(120)).await.unwrap();

        assert_eq!(
            ledger.try_consume("t", now).await.unwrap(),
            ConsumeOutcome::Consumed(1)
        );
        assert_eq!(
            ledger.try_consume("t", now).await.unwrap(),
            ConsumeOutcome::Exhausted
        );

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(ledger.purge_expired(), 1);
        assert!(ledger.get("t").await.unwrap().is_none());
        assert!(ledger.tokens_for_room(record.room_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_index_drops_evicted_tokens() {
        let ledger = MemoryInviteLedger::new();
        let room_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        let record = |token: &str| InviteRecord {
            token: token.into(),
            room_id,
            issuer_id: 1,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(60),
            usage_count: 0,
            max_usage: None,
        };
        ledger.put(&record("short"), Duration::from_secs(60)).await.unwrap();
        ledger.put(&record("long"), Duration::from_secs(600)).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        // No purge pass ran; the lookup itself prunes the index.
        let tokens = ledger.tokens_for_room(room_id).await.unwrap();
        assert_eq!(tokens, vec!["long".to_string()]);
        assert_eq!(ledger.rooms.get(&room_id).map(|set| set.len()), Some(1));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(ledger.tokens_for_room(room_id).await.unwrap().is_empty());
        assert!(ledger.rooms.get(&room_id).is_none());
    }
}
