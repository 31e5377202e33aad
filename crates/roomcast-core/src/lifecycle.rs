//! Room lifecycle: creation, membership, ownership and deletion.
//!
//! Every change that reads and then writes room state goes through
//! [`RoomStore::mutate`], so capacity and the single-owner rule hold under
//! concurrent requests.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{within, CoreError};
use crate::invite::{revoke_room_tokens, InviteLedger};
use crate::metrics;
use crate::room::{
    Membership, Role, Room, RoomConfig, RoomId, RoomListing, RoomPatch, RoomSnapshot, RoomSpec,
    RoomWrite, UserId, UserRoom,
};
use crate::store::{Mutation, RoomPlan, RoomStore};

/// A room with viewer-specific flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    #[serde(flatten)]
    pub room: Room,
    pub member_count: u32,
    pub owner_id: Option<UserId>,
    pub is_owner: bool,
    pub is_member: bool,
}

impl RoomView {
    /// `snapshot` as seen by `viewer`.
    #[must_use]
    pub fn new(snapshot: &RoomSnapshot, viewer: UserId) -> Self {
        Self {
            room: snapshot.room.clone(),
            member_count: snapshot.member_count(),
            owner_id: snapshot.owner_id(),
            is_owner: snapshot.is_owner(viewer),
            is_member: snapshot.is_member(viewer),
        }
    }
}

/// A page of public rooms.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPage {
    pub rooms: Vec<RoomListing>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

/// Outcome of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// `false` if the user was already a member.
    pub joined: bool,
    pub member_count: u32,
}

/// Outcome of a leave.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub member_count: u32,
    /// Set when ownership passed to another member.
    pub new_owner: Option<UserId>,
    /// Set when the last member left.
    pub archived: bool,
    /// Room state after the leave.
    pub room: RoomSnapshot,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedRoom {
    pub room_id: RoomId,
    pub revoked_invites: usize,
}

/// Room lifecycle service.
pub struct RoomService {
    store: Arc<dyn RoomStore>,
    ledger: Arc<dyn InviteLedger>,
    config: RoomConfig,
}

impl RoomService {
    /// Create a new room service.
    #[must_use]
    pub fn new(store: Arc<dyn RoomStore>, ledger: Arc<dyn InviteLedger>, config: RoomConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Get the service configuration.
    #[must_use]
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Create a room owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput`/`InvalidCapacity` for bad parameters, or
    /// `Unavailable` if the store fails.
    #[instrument(skip_all, fields(owner = owner))]
    pub async fn create_room(&self, owner: UserId, spec: RoomSpec) -> Result<RoomView, CoreError> {
        let details = self.config.details_for(spec)?;
        let snapshot = RoomSnapshot::create(Uuid::new_v4(), owner, details, Utc::now());

        self.call(self.store.insert(&snapshot)).await?;

        metrics::record_room_created();
        info!(room = %snapshot.room.id, owner, "Room created");
        Ok(RoomView::new(&snapshot, owner))
    }

    /// Join a room the user asked for by id.
    ///
    /// Private rooms are invisible to non-members and report `NotFound`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Full`, or `Unavailable`.
    pub async fn request_join(&self, room_id: RoomId, user: UserId) -> Result<JoinOutcome, CoreError> {
        self.join(room_id, user, false).await
    }

    /// Join a room, bypassing the privacy check. Used by invite redemption.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Full`, or `Unavailable`.
    pub async fn join_room(&self, room_id: RoomId, user: UserId) -> Result<JoinOutcome, CoreError> {
        self.join(room_id, user, true).await
    }

    #[instrument(skip(self), fields(room = %room_id))]
    async fn join(&self, room_id: RoomId, user: UserId, invited: bool) -> Result<JoinOutcome, CoreError> {
        let mutation = self
            .mutate(room_id, &|snapshot| {
                if snapshot.room.is_archived() {
                    return Err(CoreError::NotFound("Room"));
                }
                if snapshot.is_member(user) {
                    return Ok(vec![]);
                }
                if snapshot.room.is_private && !invited {
                    return Err(CoreError::NotFound("Room"));
                }
                if snapshot.member_count() >= snapshot.room.capacity {
                    return Err(CoreError::Full);
                }
                Ok(vec![
                    RoomWrite::InsertMember {
                        user_id: user,
                        role: Role::Member,
                    },
                    RoomWrite::Touch,
                ])
            })
            .await?;

        let after = present(mutation.after)?;
        let joined = !mutation.before.is_member(user);
        if joined {
            metrics::record_membership_change("join");
            debug!(user, members = after.member_count(), "Joined room");
        }

        Ok(JoinOutcome {
            room_id,
            joined,
            member_count: after.member_count(),
        })
    }

    /// Remove `user` from the room.
    ///
    /// An owner who leaves hands ownership to the earliest-joined remaining
    /// member (lowest user id on ties). The last member out archives the room.
    ///
    /// # Errors
    ///
    /// `NotMember`, `NotFound`, or `Unavailable`.
    #[instrument(skip(self), fields(room = %room_id))]
    pub async fn leave_room(&self, room_id: RoomId, user: UserId) -> Result<LeaveOutcome, CoreError> {
        let mutation = self
            .mutate(room_id, &|snapshot| {
                let member = snapshot.member(user).ok_or(CoreError::NotMember)?;

                let mut writes = Vec::with_capacity(4);
                if member.role == Role::Owner {
                    match snapshot.successor_for(user) {
                        Some(next) => {
                            writes.push(RoomWrite::SetRole {
                                user_id: user,
                                role: Role::Member,
                            });
                            writes.push(RoomWrite::SetRole {
                                user_id: next.user_id,
                                role: Role::Owner,
                            });
                            writes.push(RoomWrite::RemoveMember { user_id: user });
                        }
                        None => {
                            writes.push(RoomWrite::RemoveMember { user_id: user });
                            writes.push(RoomWrite::Archive);
                        }
                    }
                } else {
                    writes.push(RoomWrite::RemoveMember { user_id: user });
                }
                writes.push(RoomWrite::Touch);
                Ok(writes)
            })
            .await?;

        let after = present(mutation.after)?;
        let new_owner = match (mutation.before.owner_id(), after.owner_id()) {
            (Some(old), Some(new)) if old != new => Some(new),
            _ => None,
        };
        let archived = after.room.is_archived() && !mutation.before.room.is_archived();

        metrics::record_membership_change("leave");
        if let Some(owner) = new_owner {
            info!(from = user, to = owner, "Ownership passed on leave");
        }
        if archived {
            info!("Last member left, room archived");
        }

        Ok(LeaveOutcome {
            room_id,
            member_count: after.member_count(),
            new_owner,
            archived,
            room: after,
        })
    }

    /// Update room fields. Owner only.
    ///
    /// # Errors
    ///
    /// `NotOwner`, `NotFound`, `InvalidCapacity` (including a capacity below
    /// the current member count), `InvalidInput`, or `Unavailable`.
    #[instrument(skip(self, patch), fields(room = %room_id))]
    pub async fn update_room(
        &self,
        room_id: RoomId,
        user: UserId,
        patch: RoomPatch,
    ) -> Result<RoomSnapshot, CoreError> {
        if patch.is_empty() {
            return Err(CoreError::invalid("No fields to update"));
        }

        let config = &self.config;
        let mutation = self
            .mutate(room_id, &|snapshot| {
                if snapshot.room.is_archived() {
                    return Err(CoreError::NotFound("Room"));
                }
                if !snapshot.is_owner(user) {
                    return Err(CoreError::NotOwner);
                }
                let next = config.merge(&snapshot.details(), &patch)?;
                if next.capacity < snapshot.member_count() {
                    return Err(CoreError::InvalidCapacity(format!(
                        "room has {} members",
                        snapshot.member_count()
                    )));
                }
                Ok(vec![RoomWrite::UpdateDetails(next)])
            })
            .await?;

        debug!("Room updated");
        present(mutation.after)
    }

    /// Hand ownership to another member. Owner only.
    ///
    /// # Errors
    ///
    /// `NotOwner`, `NotMember` (target is not a member), `InvalidInput`
    /// (target is the caller), `NotFound`, or `Unavailable`.
    #[instrument(skip(self), fields(room = %room_id))]
    pub async fn transfer_ownership(
        &self,
        room_id: RoomId,
        owner: UserId,
        target: UserId,
    ) -> Result<RoomSnapshot, CoreError> {
        if owner == target {
            return Err(CoreError::invalid("Already the owner"));
        }

        let mutation = self
            .mutate(room_id, &|snapshot| {
                if !snapshot.is_owner(owner) {
                    return Err(CoreError::NotOwner);
                }
                if !snapshot.is_member(target) {
                    return Err(CoreError::NotMember);
                }
                Ok(vec![
                    RoomWrite::SetRole {
                        user_id: owner,
                        role: Role::Member,
                    },
                    RoomWrite::SetRole {
                        user_id: target,
                        role: Role::Owner,
                    },
                ])
            })
            .await?;

        info!(from = owner, to = target, "Ownership transferred");
        present(mutation.after)
    }

    /// Delete a room. Owner only.
    ///
    /// Outstanding invites are revoked first; if that fails the room is kept.
    ///
    /// # Errors
    ///
    /// `NotOwner`, `NotFound`, or `Unavailable`.
    #[instrument(skip(self), fields(room = %room_id))]
    pub async fn delete_room(&self, room_id: RoomId, user: UserId) -> Result<DeletedRoom, CoreError> {
        let snapshot = self.load(room_id).await?.ok_or(CoreError::NotFound("Room"))?;
        if !snapshot.is_owner(user) {
            return Err(CoreError::NotOwner);
        }

        let revoked_invites = revoke_room_tokens(&*self.ledger, room_id, self.config.store_timeout)
            .await
            .map_err(|e| {
                warn!(error = %e, "Invite revocation failed, room kept");
                e
            })?;

        self.mutate(room_id, &|snapshot| {
            if !snapshot.is_owner(user) {
                return Err(CoreError::NotOwner);
            }
            Ok(vec![RoomWrite::Delete])
        })
        .await?;

        metrics::record_room_deleted();
        info!(revoked_invites, "Room deleted");
        Ok(DeletedRoom {
            room_id,
            revoked_invites,
        })
    }

    /// Room details as seen by `viewer`.
    ///
    /// Private rooms the viewer is not in, and archived rooms, are `NotFound`.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Unavailable`.
    pub async fn get_room_with_stats(&self, room_id: RoomId, viewer: UserId) -> Result<RoomView, CoreError> {
        let snapshot = self.visible(room_id, viewer).await?;
        Ok(RoomView::new(&snapshot, viewer))
    }

    /// Members of a room visible to `viewer`, in join order.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Unavailable`.
    pub async fn list_members(&self, room_id: RoomId, viewer: UserId) -> Result<Vec<Membership>, CoreError> {
        let mut members = self.visible(room_id, viewer).await?.members;
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        Ok(members)
    }

    /// Public rooms, most recently active first. `page` is 1-based.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store fails.
    pub async fn list_public_rooms(&self, page: u32, limit: u32) -> Result<RoomPage, CoreError> {
        let page = page.max(1);
        let limit = limit.clamp(1, self.config.max_page_size);
        let offset = u64::from(page - 1) * u64::from(limit);

        let (rooms, total) = self.call(self.store.list_public(offset, limit)).await?;
        Ok(RoomPage {
            rooms,
            page,
            limit,
            total,
        })
    }

    /// Rooms `user` belongs to.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store fails.
    pub async fn list_user_rooms(&self, user: UserId) -> Result<Vec<UserRoom>, CoreError> {
        self.call(self.store.list_for_user(user)).await
    }

    /// Whether `user` is a member. Unknown rooms report `false`.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store fails.
    pub async fn is_member(&self, room_id: RoomId, user: UserId) -> Result<bool, CoreError> {
        Ok(self
            .load(room_id)
            .await?
            .is_some_and(|s| s.is_member(user)))
    }

    /// `user`'s role in a live room.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or archived rooms, or `Unavailable`.
    pub async fn member_role(&self, room_id: RoomId, user: UserId) -> Result<Option<Role>, CoreError> {
        let snapshot = self.load(room_id).await?.ok_or(CoreError::NotFound("Room"))?;
        if snapshot.room.is_archived() {
            return Err(CoreError::NotFound("Room"));
        }
        Ok(snapshot.member(user).map(|m| m.role))
    }

    /// Refresh the room's last activity and the sender's last-seen time.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Unavailable`.
    pub async fn touch_activity(&self, room_id: RoomId, user: UserId) -> Result<(), CoreError> {
        self.mutate(room_id, &|snapshot| {
            let mut writes = vec![RoomWrite::Touch];
            if snapshot.is_member(user) {
                writes.push(RoomWrite::SeenMember { user_id: user });
            }
            Ok(writes)
        })
        .await?;
        Ok(())
    }

    /// Load a snapshot.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store fails.
    pub async fn load(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, CoreError> {
        self.call(self.store.load(room_id)).await
    }

    async fn visible(&self, room_id: RoomId, viewer: UserId) -> Result<RoomSnapshot, CoreError> {
        match self.load(room_id).await? {
            Some(s) if s.room.is_archived() => Err(CoreError::NotFound("Room")),
            Some(s) if s.room.is_private && !s.is_member(viewer) => Err(CoreError::NotFound("Room")),
            Some(s) => Ok(s),
            None => Err(CoreError::NotFound("Room")),
        }
    }

    async fn mutate(
        &self,
        room_id: RoomId,
        plan: &RoomPlan<'_>,
    ) -> Result<Mutation, CoreError> {
        let mutation = self.call(self.store.mutate(room_id, plan)).await?;
        if let Some(after) = &mutation.after {
            debug_assert!(after.check_invariants().is_ok(), "{:?}", after.check_invariants());
        }
        Ok(mutation)
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        within(self.config.store_timeout, "room store", fut).await
    }
}

fn present(after: Option<RoomSnapshot>) -> Result<RoomSnapshot, CoreError> {
    after.ok_or(CoreError::NotFound("Room"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invite::MemoryInviteLedger;
    use crate::store::MemoryRoomStore;

    fn service() -> RoomService {
        RoomService::new(
            Arc::new(MemoryRoomStore::new()),
            Arc::new(MemoryInviteLedger::new()),
            RoomConfig::default(),
        )
    }

    fn spec(name: &str, is_private: bool, capacity: u32) -> RoomSpec {
        RoomSpec {
            name: name.into(),
            is_private,
            capacity: Some(capacity),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_room_owner_is_member() {
        let svc = service();
        let view = svc.create_room(1, spec("lobby", false, 10)).await.unwrap();

        assert!(view.is_owner);
        assert_eq!(view.member_count, 1);
        assert_eq!(svc.member_role(view.room.id, 1).await.unwrap(), Some(Role::Owner));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let svc = service();
        let room = svc.create_room(1, spec("lobby", false, 10)).await.unwrap().room.id;

        let first = svc.request_join(room, 2).await.unwrap();
        let second = svc.request_join(room, 2).await.unwrap();

        assert!(first.joined);
        assert!(!second.joined);
        assert_eq!(second.member_count, 2);
    }

    #[tokio::test]
    async fn test_join_full_room() {
        let svc = service();
        let room = svc.create_room(1, spec("pair", false, 2)).await.unwrap().room.id;

        svc.request_join(room, 2).await.unwrap();
        assert_eq!(svc.request_join(room, 3).await.unwrap_err(), CoreError::Full);
    }

    #[tokio::test]
    async fn test_private_room_hidden_from_strangers() {
        let svc = service();
        let room = svc.create_room(1, spec("secret", true, 10)).await.unwrap().room.id;

        assert_eq!(
            svc.request_join(room, 2).await.unwrap_err(),
            CoreError::NotFound("Room")
        );
        assert_eq!(
            svc.get_room_with_stats(room, 2).await.unwrap_err(),
            CoreError::NotFound("Room")
        );
        assert!(svc.join_room(room, 2).await.unwrap().joined);
        assert!(svc.get_room_with_stats(room, 2).await.unwrap().is_member);
    }

    #[tokio::test]
    async fn test_owner_leave_promotes_next_member() {
        let svc = service();
        let room = svc.create_room(1, spec("lobby", false, 10)).await.unwrap().room.id;
        svc.request_join(room, 2).await.unwrap();

        let outcome = svc.leave_room(room, 1).await.unwrap();
        assert_eq!(outcome.new_owner, Some(2));
        assert!(!outcome.archived);
        assert_eq!(svc.member_role(room, 2).await.unwrap(), Some(Role::Owner));

        let outcome = svc.leave_room(room, 2).await.unwrap();
        assert!(outcome.archived);
        assert_eq!(outcome.member_count, 0);
        assert!(svc.load(room).await.unwrap().unwrap().room.is_archived());
    }

    #[tokio::test]
    async fn test_leave_non_member() {
        let svc = service();
        let room = svc.create_room(1, spec("lobby", false, 10)).await.unwrap().room.id;
        assert_eq!(svc.leave_room(room, 7).await.unwrap_err(), CoreError::NotMember);
    }

    #[tokio::test]
    async fn test_update_room_rules() {
        let svc = service();
        let room = svc.create_room(1, spec("lobby", false, 10)).await.unwrap().room.id;
        svc.request_join(room, 2).await.unwrap();
        svc.request_join(room, 3).await.unwrap();

        let shrink = RoomPatch {
            capacity: Some(2),
            ..Default::default()
        };
        assert!(matches!(
            svc.update_room(room, 1, shrink).await,
            Err(CoreError::InvalidCapacity(_))
        ));

        let rename = RoomPatch {
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert_eq!(
            svc.update_room(room, 2, rename.clone()).await.unwrap_err(),
            CoreError::NotOwner
        );
        let updated = svc.update_room(room, 1, rename).await.unwrap();
        assert_eq!(updated.room.name, "renamed");
    }

    #[tokio::test]
    async fn test_transfer_ownership() {
        let svc = service();
        let room = svc.create_room(1, spec("lobby", false, 10)).await.unwrap().room.id;
        svc.request_join(room, 2).await.unwrap();

        assert_eq!(
            svc.transfer_ownership(room, 1, 3).await.unwrap_err(),
            CoreError::NotMember
        );
        let after = svc.transfer_ownership(room, 1, 2).await.unwrap();
        assert_eq!(after.owner_id(), Some(2));
        assert!(after.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_delete_room_owner_only() {
        let svc = service();
        let room = svc.create_room(1, spec("lobby", false, 10)).await.unwrap().room.id;
        svc.request_join(room, 2).await.unwrap();

        assert_eq!(svc.delete_room(room, 2).await.unwrap_err(), CoreError::NotOwner);
        svc.delete_room(room, 1).await.unwrap();
        assert!(svc.load(room).await.unwrap().is_none());
        assert_eq!(
            svc.delete_room(room, 1).await.unwrap_err(),
            CoreError::NotFound("Room")
        );
    }

    #[tokio::test]
    async fn test_list_public_rooms_clamps_limit() {
        let svc = service();
        for i in 0..3 {
            svc.create_room(1, spec(&format!("room-{i}"), false, 10)).await.unwrap();
        }
        svc.create_room(1, spec("hidden", true, 10)).await.unwrap();

        let page = svc.list_public_rooms(1, 500).await.unwrap();
        assert_eq!(page.limit, 50);
        assert_eq!(page.total, 3);

        let page = svc.list_public_rooms(0, 0).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 1);
        assert_eq!(page.rooms.len(), 1);
        assert_eq!(page.total, 3);
    }
}
