//! Room and membership model.
//!
//! A [`RoomSnapshot`] is a room together with all of its memberships. Every
//! state change is expressed as a list of [`RoomWrite`]s so that each store
//! backend can apply the same plan atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::CoreError;

pub use roomcast_protocol::{RoomId, UserId};

/// Settings key marking a room as archived.
pub const ARCHIVED_KEY: &str = "archived";

/// A member's role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Member,
}

impl Role {
    /// Storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Member => "member",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Role::Owner),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

/// A chat room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub created_by: UserId,
    pub is_private: bool,
    pub capacity: u32,
    pub settings: Map<String, Value>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// Whether the room was archived after its last member left.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.settings
            .get(ARCHIVED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A user's membership in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Editable room fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub capacity: u32,
    pub settings: Map<String, Value>,
}

/// One step of an atomic room change.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomWrite {
    /// Add a membership.
    InsertMember { user_id: UserId, role: Role },
    /// Change an existing member's role.
    SetRole { user_id: UserId, role: Role },
    /// Remove a membership.
    RemoveMember { user_id: UserId },
    /// Refresh a member's last-seen time.
    SeenMember { user_id: UserId },
    /// Replace the editable fields.
    UpdateDetails(RoomDetails),
    /// Mark the room archived.
    Archive,
    /// Refresh the room's last activity.
    Touch,
    /// Remove the room and all memberships.
    Delete,
}

/// A room with its memberships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: Room,
    pub members: Vec<Membership>,
}

impl RoomSnapshot {
    /// A fresh room owned by `owner`.
    #[must_use]
    pub fn create(id: RoomId, owner: UserId, details: RoomDetails, now: DateTime<Utc>) -> Self {
        Self {
            room: Room {
                id,
                name: details.name,
                description: details.description,
                created_by: owner,
                is_private: details.is_private,
                capacity: details.capacity,
                settings: details.settings,
                last_activity: now,
                created_at: now,
                updated_at: now,
            },
            members: vec![Membership {
                room_id: id,
                user_id: owner,
                role: Role::Owner,
                joined_at: now,
                last_seen_at: now,
            }],
        }
    }

    /// Number of memberships.
    #[must_use]
    pub fn member_count(&self) -> u32 {
        u32::try_from(self.members.len()).unwrap_or(u32::MAX)
    }

    /// The owner's membership, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&Membership> {
        self.members.iter().find(|m| m.role == Role::Owner)
    }

    /// Current owner id.
    #[must_use]
    pub fn owner_id(&self) -> Option<UserId> {
        self.owner().map(|m| m.user_id)
    }

    /// Membership of `user_id`.
    #[must_use]
    pub fn member(&self, user_id: UserId) -> Option<&Membership> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Whether `user_id` is a member.
    #[must_use]
    pub fn is_member(&self, user_id: UserId) -> bool {
        self.member(user_id).is_some()
    }

    /// Whether `user_id` owns the room.
    #[must_use]
    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.member(user_id).is_some_and(|m| m.role == Role::Owner)
    }

    /// The member who inherits ownership when `leaving` departs.
    ///
    /// Earliest `joined_at` wins; ties go to the lowest user id.
    #[must_use]
    pub fn successor_for(&self, leaving: UserId) -> Option<&Membership> {
        self.members
            .iter()
            .filter(|m| m.user_id != leaving)
            .min_by(|a, b| {
                a.joined_at
                    .cmp(&b.joined_at)
                    .then(a.user_id.cmp(&b.user_id))
            })
    }

    /// Current editable fields.
    #[must_use]
    pub fn details(&self) -> RoomDetails {
        RoomDetails {
            name: self.room.name.clone(),
            description: self.room.description.clone(),
            is_private: self.room.is_private,
            capacity: self.room.capacity,
            settings: self.room.settings.clone(),
        }
    }

    /// Apply writes in order. `Delete` is left to the store.
    pub fn apply(&mut self, writes: &[RoomWrite], now: DateTime<Utc>) {
        for write in writes {
            match write {
                RoomWrite::InsertMember { user_id, role } => {
                    if !self.is_member(*user_id) {
                        self.members.push(Membership {
                            room_id: self.room.id,
                            user_id: *user_id,
                            role: *role,
                            joined_at: now,
                            last_seen_at: now,
                        });
                    }
                }
                RoomWrite::SetRole { user_id, role } => {
                    if let Some(m) = self.members.iter_mut().find(|m| m.user_id == *user_id) {
                        m.role = *role;
                    }
                }
                RoomWrite::RemoveMember { user_id } => {
                    self.members.retain(|m| m.user_id != *user_id);
                }
                RoomWrite::SeenMember { user_id } => {
                    if let Some(m) = self.members.iter_mut().find(|m| m.user_id == *user_id) {
                        m.last_seen_at = now;
                    }
                }
                RoomWrite::UpdateDetails(details) => {
                    self.room.name = details.name.clone();
                    self.room.description = details.description.clone();
                    self.room.is_private = details.is_private;
                    self.room.capacity = details.capacity;
                    self.room.settings = details.settings.clone();
                    self.room.updated_at = now;
                }
                RoomWrite::Archive => {
                    self.room
                        .settings
                        .insert(ARCHIVED_KEY.to_string(), Value::Bool(true));
                    self.room.updated_at = now;
                }
                RoomWrite::Touch => {
                    self.room.last_activity = now;
                }
                RoomWrite::Delete => {}
            }
        }
    }

    /// Check the membership invariants.
    ///
    /// # Errors
    ///
    /// Describes the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        let owners = self
            .members
            .iter()
            .filter(|m| m.role == Role::Owner)
            .count();

        if self.members.is_empty() {
            if owners != 0 {
                return Err("empty room has an owner".into());
            }
        } else if owners != 1 {
            return Err(format!("room has {owners} owners"));
        }

        if self.member_count() > self.room.capacity {
            return Err(format!(
                "{} members exceed capacity {}",
                self.member_count(),
                self.room.capacity
            ));
        }

        let mut ids: Vec<UserId> = self.members.iter().map(|m| m.user_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.members.len() {
            return Err("duplicate membership".into());
        }

        Ok(())
    }
}

/// A public room in a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    #[serde(flatten)]
    pub room: Room,
    pub member_count: u32,
    pub owner_id: Option<UserId>,
}

impl RoomListing {
    #[must_use]
    pub fn from_snapshot(snapshot: &RoomSnapshot) -> Self {
        Self {
            room: snapshot.room.clone(),
            member_count: snapshot.member_count(),
            owner_id: snapshot.owner_id(),
        }
    }
}

/// A room as seen by one of its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoom {
    #[serde(flatten)]
    pub room: Room,
    pub role: Role,
    pub member_count: u32,
    pub joined_at: DateTime<Utc>,
}

/// Room creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

/// Partial room update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

impl RoomPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.is_private.is_none()
            && self.capacity.is_none()
            && self.settings.is_none()
    }
}

/// Room service configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Capacity used when none is given.
    pub default_capacity: u32,
    /// Smallest allowed capacity.
    pub min_capacity: u32,
    /// Largest allowed capacity.
    pub max_capacity: u32,
    /// Maximum room name length in characters.
    pub max_name_length: usize,
    /// Maximum description length in characters.
    pub max_description_length: usize,
    /// Largest page size for public listings.
    pub max_page_size: u32,
    /// Deadline for each store call.
    pub store_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            default_capacity: 10,
            min_capacity: 2,
            max_capacity: 100,
            max_name_length: 100,
            max_description_length: 500,
            max_page_size: 50,
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl RoomConfig {
    /// Validate creation parameters and fill in defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` or `InvalidCapacity` for out-of-range fields.
    pub fn details_for(&self, spec: RoomSpec) -> Result<RoomDetails, CoreError> {
        let name = self.check_name(&spec.name)?;
        let description = self.check_description(spec.description)?;
        let capacity = self.check_capacity(spec.capacity.unwrap_or(self.default_capacity))?;
        let settings = spec.settings.unwrap_or_default();
        check_settings(&settings)?;

        Ok(RoomDetails {
            name,
            description,
            is_private: spec.is_private,
            capacity,
            settings,
        })
    }

    /// Merge a patch into the current fields.
    ///
    /// Member count is not checked here; that needs the live snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` or `InvalidCapacity` for out-of-range fields.
    pub fn merge(&self, current: &RoomDetails, patch: &RoomPatch) -> Result<RoomDetails, CoreError> {
        let mut next = current.clone();

        if let Some(name) = &patch.name {
            next.name = self.check_name(name)?;
        }
        if let Some(description) = &patch.description {
            next.description = self.check_description(Some(description.clone()))?;
        }
        if let Some(is_private) = patch.is_private {
            next.is_private = is_private;
        }
        if let Some(capacity) = patch.capacity {
            next.capacity = self.check_capacity(capacity)?;
        }
        if let Some(settings) = &patch.settings {
            check_settings(settings)?;
            // Archive flag is owned by the lifecycle, not by callers.
            let archived = next.settings.get(ARCHIVED_KEY).cloned();
            next.settings = settings.clone();
            if let Some(flag) = archived {
                next.settings.insert(ARCHIVED_KEY.to_string(), flag);
            }
        }

        Ok(next)
    }

    fn check_name(&self, name: &str) -> Result<String, CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::invalid("Room name is required"));
        }
        if name.chars().count() > self.max_name_length {
            return Err(CoreError::invalid(format!(
                "Room name exceeds {} characters",
                self.max_name_length
            )));
        }
        Ok(name.to_string())
    }

    fn check_description(&self, description: Option<String>) -> Result<Option<String>, CoreError> {
        match description.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(d) if d.chars().count() > self.max_description_length => {
                Err(CoreError::invalid(format!(
                    "Description exceeds {} characters",
                    self.max_description_length
                )))
            }
            Some(d) => Ok(Some(d.to_string())),
        }
    }

    fn check_capacity(&self, capacity: u32) -> Result<u32, CoreError> {
        if capacity < self.min_capacity || capacity > self.max_capacity {
            return Err(CoreError::InvalidCapacity(format!(
                "capacity must be between {} and {}",
                self.min_capacity, self.max_capacity
            )));
        }
        Ok(capacity)
    }
}

fn check_settings(settings: &Map<String, Value>) -> Result<(), CoreError> {
    if settings.contains_key(ARCHIVED_KEY) {
        return Err(CoreError::invalid("settings.archived is reserved"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn details(capacity: u32) -> RoomDetails {
        RoomDetails {
            name: "general".into(),
            description: None,
            is_private: false,
            capacity,
            settings: Map::new(),
        }
    }

    #[test]
    fn test_create_has_single_owner() {
        let snapshot = RoomSnapshot::create(Uuid::new_v4(), 1, details(10), at(0));

        assert_eq!(snapshot.member_count(), 1);
        assert_eq!(snapshot.owner_id(), Some(1));
        assert!(snapshot.check_invariants().is_ok());
    }

    #[test]
    fn test_successor_earliest_then_lowest_id() {
        let mut snapshot = RoomSnapshot::create(Uuid::new_v4(), 1, details(10), at(0));
        snapshot.apply(&[RoomWrite::InsertMember { user_id: 9, role: Role::Member }], at(5));
        snapshot.apply(&[RoomWrite::InsertMember { user_id: 4, role: Role::Member }], at(5));
        snapshot.apply(&[RoomWrite::InsertMember { user_id: 2, role: Role::Member }], at(8));

        assert_eq!(snapshot.successor_for(1).map(|m| m.user_id), Some(4));
        assert_eq!(snapshot.successor_for(4).map(|m| m.user_id), Some(1));
    }

    #[test]
    fn test_apply_archive_and_touch() {
        let mut snapshot = RoomSnapshot::create(Uuid::new_v4(), 1, details(10), at(0));
        snapshot.apply(
            &[RoomWrite::RemoveMember { user_id: 1 }, RoomWrite::Archive, RoomWrite::Touch],
            at(30),
        );

        assert!(snapshot.room.is_archived());
        assert_eq!(snapshot.room.last_activity, at(30));
        assert!(snapshot.check_invariants().is_ok());
    }

    #[test]
    fn test_invariants_detect_two_owners() {
        let mut snapshot = RoomSnapshot::create(Uuid::new_v4(), 1, details(10), at(0));
        snapshot.apply(&[RoomWrite::InsertMember { user_id: 2, role: Role::Owner }], at(1));

        assert!(snapshot.check_invariants().is_err());
    }

    #[test]
    fn test_details_for_defaults_and_bounds() {
        let config = RoomConfig::default();

        let d = config
            .details_for(RoomSpec {
                name: "  lobby ".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(d.name, "lobby");
        assert_eq!(d.capacity, 10);

        let err = config
            .details_for(RoomSpec {
                name: "x".into(),
                capacity: Some(1),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidCapacity(_)));

        let err = config.details_for(RoomSpec::default()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_merge_keeps_archive_flag_reserved() {
        let config = RoomConfig::default();
        let current = details(10);

        let mut settings = Map::new();
        settings.insert(ARCHIVED_KEY.into(), Value::Bool(false));
        let patch = RoomPatch {
            settings: Some(settings),
            ..Default::default()
        };
        assert!(config.merge(&current, &patch).is_err());

        let mut settings = Map::new();
        settings.insert("topic".into(), Value::String("rust".into()));
        let patch = RoomPatch {
            name: Some("renamed".into()),
            settings: Some(settings),
            ..Default::default()
        };
        let merged = config.merge(&current, &patch).unwrap();
        assert_eq!(merged.name, "renamed");
        assert_eq!(merged.settings["topic"], "rust");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("owner"), Some(Role::Owner));
        assert_eq!(Role::parse(Role::Member.as_str()), Some(Role::Member));
        assert_eq!(Role::parse("admin"), None);
    }
}
