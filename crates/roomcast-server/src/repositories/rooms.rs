//! Room store on Postgres.
//!
//! Every change locks the room row with `SELECT ... FOR UPDATE`, loads the
//! roster, runs the caller's plan, and writes the result in the same
//! transaction. Writes are issued in plan order, which keeps the single-owner
//! unique index satisfied after every statement.
//!
//! # Security
//!
//! - All queries use bound parameters

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomcast_core::room::{Membership, RoomListing, RoomWrite, UserRoom};
use roomcast_core::store::{Mutation, RoomPlan};
use roomcast_core::{CoreError, Role, Room, RoomId, RoomSnapshot, RoomStore, StoreError, UserId};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

/// Room columns, for queries aliasing `rooms` as `r`.
const ROOM_COLUMNS: &str = "r.id, r.name, r.description, r.created_by, r.is_private, r.capacity, \
     r.settings, r.last_activity, r.created_at, r.updated_at";

/// Excludes archived rooms.
const NOT_ARCHIVED: &str = "NOT COALESCE(r.settings -> 'archived' = 'true'::jsonb, FALSE)";

fn db(err: sqlx::Error) -> CoreError {
    StoreError::Unavailable(err.to_string()).into()
}

fn corrupt(what: &str) -> CoreError {
    StoreError::Corrupt(what.to_string()).into()
}

#[derive(Debug, sqlx::FromRow)]
struct RoomRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    created_by: i64,
    is_private: bool,
    capacity: i32,
    settings: Json<Map<String, Value>>,
    last_activity: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RoomRow {
    fn into_room(self) -> Result<Room, CoreError> {
        Ok(Room {
            id: self.id,
            name: self.name,
            description: self.description,
            created_by: self.created_by,
            is_private: self.is_private,
            capacity: u32::try_from(self.capacity).map_err(|_| corrupt("negative capacity"))?,
            settings: self.settings.0,
            last_activity: self.last_activity,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MemberRow {
    room_id: Uuid,
    user_id: i64,
    role: String,
    joined_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl MemberRow {
    fn into_membership(self) -> Result<Membership, CoreError> {
        Ok(Membership {
            room_id: self.room_id,
            user_id: self.user_id,
            role: parse_role(&self.role)?,
            joined_at: self.joined_at,
            last_seen_at: self.last_seen_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    #[sqlx(flatten)]
    room: RoomRow,
    member_count: i64,
    owner_id: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRoomRow {
    #[sqlx(flatten)]
    room: RoomRow,
    role: String,
    member_count: i64,
    joined_at: DateTime<Utc>,
}

fn parse_role(raw: &str) -> Result<Role, CoreError> {
    Role::parse(raw).ok_or_else(|| corrupt("unknown role"))
}

fn count(n: i64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn capacity(room: &Room) -> i32 {
    i32::try_from(room.capacity).unwrap_or(i32::MAX)
}

/// Room store backed by Postgres.
#[derive(Clone)]
pub struct PgRoomStore {
    pool: PgPool,
}

impl PgRoomStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

async fn insert_member(conn: &mut PgConnection, member: &Membership) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO room_members (room_id, user_id, role, joined_at, last_seen_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (room_id, user_id) DO NOTHING
        "#,
    )
    .bind(member.room_id)
    .bind(member.user_id)
    .bind(member.role.as_str())
    .bind(member.joined_at)
    .bind(member.last_seen_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_room(conn: &mut PgConnection, room: &Room) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE rooms
        SET name = $2,
            description = $3,
            is_private = $4,
            capacity = $5,
            settings = $6,
            last_activity = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(room.id)
    .bind(&room.name)
    .bind(&room.description)
    .bind(room.is_private)
    .bind(capacity(room))
    .bind(Json(&room.settings))
    .bind(room.last_activity)
    .bind(room.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Persist the writes of one plan. `after` is the snapshot with the writes
/// applied, and supplies the timestamps.
async fn persist(conn: &mut PgConnection, writes: &[RoomWrite], after: &RoomSnapshot) -> Result<(), sqlx::Error> {
    let room_id = after.room.id;
    let mut room_changed = false;

    for write in writes {
        match write {
            RoomWrite::InsertMember { user_id, .. } => {
                if let Some(member) = after.member(*user_id) {
                    insert_member(&mut *conn, member).await?;
                }
            }
            RoomWrite::SetRole { user_id, role } => {
                sqlx::query("UPDATE room_members SET role = $3 WHERE room_id = $1 AND user_id = $2")
                    .bind(room_id)
                    .bind(*user_id)
                    .bind(role.as_str())
                    .execute(&mut *conn)
                    .await?;
            }
            RoomWrite::RemoveMember { user_id } => {
                sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
                    .bind(room_id)
                    .bind(*user_id)
                    .execute(&mut *conn)
                    .await?;
            }
            RoomWrite::SeenMember { user_id } => {
                if let Some(member) = after.member(*user_id) {
                    sqlx::query(
                        "UPDATE room_members SET last_seen_at = $3 WHERE room_id = $1 AND user_id = $2",
                    )
                    .bind(room_id)
                    .bind(*user_id)
                    .bind(member.last_seen_at)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            RoomWrite::UpdateDetails(_) | RoomWrite::Archive | RoomWrite::Touch => {
                room_changed = true;
            }
            RoomWrite::Delete => {}
        }
    }

    if room_changed {
        write_room(conn, &after.room).await?;
    }
    Ok(())
}

#[async_trait]
impl RoomStore for PgRoomStore {
    #[instrument(skip_all, fields(room = %snapshot.room.id))]
    async fn insert(&self, snapshot: &RoomSnapshot) -> Result<(), CoreError> {
        let room = &snapshot.room;
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO rooms (id, name, description, created_by, is_private, capacity,
                               settings, last_activity, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(room.id)
        .bind(&room.name)
        .bind(&room.description)
        .bind(room.created_by)
        .bind(room.is_private)
        .bind(capacity(room))
        .bind(Json(&room.settings))
        .bind(room.last_activity)
        .bind(room.created_at)
        .bind(room.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        for member in &snapshot.members {
            insert_member(&mut tx, member).await.map_err(db)?;
        }

        tx.commit().await.map_err(db)
    }

    async fn load(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        load_snapshot(&mut conn, room_id, false).await
    }

    #[instrument(skip_all, fields(room = %room_id))]
    async fn mutate(&self, room_id: RoomId, plan: &RoomPlan<'_>) -> Result<Mutation, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let before = load_snapshot(&mut tx, room_id, true)
            .await?
            .ok_or(CoreError::NotFound("Room"))?;

        // A plan error drops the transaction, rolling back the lock.
        let writes = plan(&before)?;

        if writes.contains(&RoomWrite::Delete) {
            sqlx::query("DELETE FROM rooms WHERE id = $1")
                .bind(room_id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            return Ok(Mutation { before, after: None });
        }

        let mut after = before.clone();
        after.apply(&writes, Utc::now());
        persist(&mut tx, &writes, &after).await.map_err(db)?;
        tx.commit().await.map_err(db)?;

        Ok(Mutation {
            before,
            after: Some(after),
        })
    }

    async fn list_public(&self, offset: u64, limit: u32) -> Result<(Vec<RoomListing>, u64), CoreError> {
        let listing_query = format!(
            r#"
            SELECT {ROOM_COLUMNS},
                   (SELECT COUNT(*) FROM room_members m WHERE m.room_id = r.id) AS member_count,
                   (SELECT m.user_id FROM room_members m
                     WHERE m.room_id = r.id AND m.role = 'owner') AS owner_id
            FROM rooms r
            WHERE NOT r.is_private AND {NOT_ARCHIVED}
            ORDER BY r.last_activity DESC, r.id
            LIMIT $1 OFFSET $2
            "#
        );
        let rows: Vec<ListingRow> = sqlx::query_as(&listing_query)
            .bind(i64::from(limit))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let total_query =
            format!("SELECT COUNT(*) FROM rooms r WHERE NOT r.is_private AND {NOT_ARCHIVED}");
        let total: i64 = sqlx::query_scalar(&total_query)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;

        let rooms = rows
            .into_iter()
            .map(|row| {
                Ok(RoomListing {
                    room: row.room.into_room()?,
                    member_count: count(row.member_count),
                    owner_id: row.owner_id,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        Ok((rooms, u64::try_from(total).unwrap_or(0)))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<UserRoom>, CoreError> {
        let query = format!(
            r#"
            SELECT {ROOM_COLUMNS},
                   mine.role,
                   mine.joined_at,
                   (SELECT COUNT(*) FROM room_members m WHERE m.room_id = r.id) AS member_count
            FROM room_members mine
            JOIN rooms r ON r.id = mine.room_id
            WHERE mine.user_id = $1 AND {NOT_ARCHIVED}
            ORDER BY r.last_activity DESC
            "#
        );
        let rows: Vec<UserRoomRow> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        rows.into_iter()
            .map(|row| {
                Ok(UserRoom {
                    room: row.room.into_room()?,
                    role: parse_role(&row.role)?,
                    member_count: count(row.member_count),
                    joined_at: row.joined_at,
                })
            })
            .collect()
    }
}

async fn load_snapshot(
    conn: &mut PgConnection,
    room_id: RoomId,
    for_update: bool,
) -> Result<Option<RoomSnapshot>, CoreError> {
    let query = format!(
        "SELECT {ROOM_COLUMNS} FROM rooms r WHERE r.id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<RoomRow> = sqlx::query_as(&query)
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let members: Vec<MemberRow> = sqlx::query_as(
        r#"
        SELECT room_id, user_id, role, joined_at, last_seen_at
        FROM room_members
        WHERE room_id = $1
        ORDER BY joined_at, user_id
        "#,
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;

    Ok(Some(RoomSnapshot {
        room: row.into_room()?,
        members: members
            .into_iter()
            .map(MemberRow::into_membership)
            .collect::<Result<_, _>>()?,
    }))
}
