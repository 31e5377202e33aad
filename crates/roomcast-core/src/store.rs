//! Durable room storage.
//!
//! Stores apply a caller-supplied plan against the current snapshot under a
//! per-room lock (or row lock), so reads and writes of one change are atomic.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::error::CoreError;
use crate::room::{RoomId, RoomListing, RoomSnapshot, RoomWrite, UserId, UserRoom};

/// Room store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Room store unavailable: {0}")]
    Unavailable(String),

    /// The backend returned data that does not map onto the model.
    #[error("Corrupt room data: {0}")]
    Corrupt(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::Unavailable(err.to_string())
    }
}

/// Decides the writes for one change, given the current snapshot.
pub type RoomPlan<'a> = dyn Fn(&RoomSnapshot) -> Result<Vec<RoomWrite>, CoreError> + Send + Sync + 'a;

/// Result of an applied plan.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Snapshot the plan saw.
    pub before: RoomSnapshot,
    /// Snapshot after the writes, `None` if the room was deleted.
    pub after: Option<RoomSnapshot>,
}

impl Mutation {
    /// Whether the plan produced no writes.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.after.as_ref() == Some(&self.before)
    }
}

/// Persistent room storage.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Insert a new room with its initial memberships.
    async fn insert(&self, snapshot: &RoomSnapshot) -> Result<(), CoreError>;

    /// Load a room with its memberships.
    async fn load(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, CoreError>;

    /// Atomically run `plan` against the room and apply its writes.
    ///
    /// Fails with `NotFound` if the room does not exist, or with the plan's
    /// own error, in which case nothing is written.
    async fn mutate(&self, room_id: RoomId, plan: &RoomPlan<'_>) -> Result<Mutation, CoreError>;

    /// Public, non-archived rooms by most recent activity, with the total count.
    async fn list_public(&self, offset: u64, limit: u32) -> Result<(Vec<RoomListing>, u64), CoreError>;

    /// Non-archived rooms `user_id` belongs to.
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<UserRoom>, CoreError>;
}

/// In-process room store.
///
/// Each room lives in one map entry; holding the entry guard while the plan
/// runs serializes changes to that room.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: DashMap<RoomId, RoomSnapshot>,
}

impl MemoryRoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rooms, archived ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn insert(&self, snapshot: &RoomSnapshot) -> Result<(), CoreError> {
        match self.rooms.entry(snapshot.room.id) {
            Entry::Occupied(_) => Err(CoreError::invalid("Room already exists")),
            Entry::Vacant(slot) => {
                slot.insert(snapshot.clone());
                Ok(())
            }
        }
    }

    async fn load(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, CoreError> {
        Ok(self.rooms.get(&room_id).map(|r| r.clone()))
    }

    async fn mutate(&self, room_id: RoomId, plan: &RoomPlan<'_>) -> Result<Mutation, CoreError> {
        match self.rooms.entry(room_id) {
            Entry::Vacant(_) => Err(CoreError::NotFound("Room")),
            Entry::Occupied(mut slot) => {
                let before = slot.get().clone();
                let writes = plan(&before)?;

                if writes.contains(&RoomWrite::Delete) {
                    slot.remove();
                    return Ok(Mutation { before, after: None });
                }

                let mut after = before.clone();
                after.apply(&writes, Utc::now());
                *slot.get_mut() = after.clone();

                Ok(Mutation {
                    before,
                    after: Some(after),
                })
            }
        }
    }

    async fn list_public(&self, offset: u64, limit: u32) -> Result<(Vec<RoomListing>, u64), CoreError> {
        let mut public: Vec<RoomListing> = self
            .rooms
            .iter()
            .filter(|r| !r.room.is_private && !r.room.is_archived())
            .map(|r| RoomListing::from_snapshot(r.value()))
            .collect();

        public.sort_by(|a, b| {
            b.room
                .last_activity
                .cmp(&a.room.last_activity)
                .then(a.room.id.cmp(&b.room.id))
        });

        let total = public.len() as u64;
        let page = public
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect();

        Ok((page, total))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<UserRoom>, CoreError> {
        let mut rooms: Vec<UserRoom> = self
            .rooms
            .iter()
            .filter(|r| !r.room.is_archived())
            .filter_map(|r| {
                r.member(user_id).map(|m| UserRoom {
                    room: r.room.clone(),
                    role: m.role,
                    member_count: r.member_count(),
                    joined_at: m.joined_at,
                })
            })
            .collect();

        rooms.sort_by(|a, b| b.room.last_activity.cmp(&a.room.last_activity));
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{RoomDetails, Role};
    use serde_json::Map;
    use uuid::Uuid;

    fn snapshot(owner: UserId, is_private: bool) -> RoomSnapshot {
        RoomSnapshot::create(
            Uuid::new_v4(),
            owner,
            RoomDetails {
                name: "room".into(),
                description: None,
                is_private,
                capacity: 3,
                settings: Map::new(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = MemoryRoomStore::new();
        let room = snapshot(1, false);

        store.insert(&room).await.unwrap();
        assert_eq!(store.load(room.room.id).await.unwrap(), Some(room.clone()));
        assert!(store.insert(&room).await.is_err());
    }

    #[tokio::test]
    async fn test_mutate_missing_room() {
        let store = MemoryRoomStore::new();
        let result = store.mutate(Uuid::new_v4(), &|_| Ok(vec![])).await;
        assert_eq!(result.unwrap_err(), CoreError::NotFound("Room"));
    }

    #[tokio::test]
    async fn test_plan_error_writes_nothing() {
        let store = MemoryRoomStore::new();
        let room = snapshot(1, false);
        store.insert(&room).await.unwrap();

        let result = store
            .mutate(room.room.id, &|_| Err(CoreError::Full))
            .await;
        assert_eq!(result.unwrap_err(), CoreError::Full);
        assert_eq!(store.load(room.room.id).await.unwrap(), Some(room));
    }

    #[tokio::test]
    async fn test_mutate_applies_and_deletes() {
        let store = MemoryRoomStore::new();
        let room = snapshot(1, false);
        let id = room.room.id;
        store.insert(&room).await.unwrap();

        let mutation = store
            .mutate(id, &|_| {
                Ok(vec![RoomWrite::InsertMember {
                    user_id: 2,
                    role: Role::Member,
                }])
            })
            .await
            .unwrap();
        assert_eq!(mutation.after.unwrap().member_count(), 2);

        let mutation = store.mutate(id, &|_| Ok(vec![RoomWrite::Delete])).await.unwrap();
        assert!(mutation.after.is_none());
        assert!(store.load(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_public_excludes_private_and_reports_total() {
        let store = MemoryRoomStore::new();
        for _ in 0..3 {
            store.insert(&snapshot(1, false)).await.unwrap();
        }
        store.insert(&snapshot(1, true)).await.unwrap();

        let (page, total) = store.list_public(0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 3);

        let (page, total) = store.list_public(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_list_for_user() {
        let store = MemoryRoomStore::new();
        store.insert(&snapshot(1, true)).await.unwrap();
        store.insert(&snapshot(2, false)).await.unwrap();

        let rooms = store.list_for_user(1).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].role, Role::Owner);
    }
}
