//! Room endpoints.

use axum::extract::{Path, Query, State};
use roomcast_core::room::{Membership, UserRoom};
use roomcast_core::{
    DeletedRoom, JoinOutcome, RoomPage, RoomPatch, RoomSpec, RoomView, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{parse_room_id, ApiJson, ApiResult};
use crate::auth::Authenticated;
use crate::routes::AppState;

/// Page size when the client does not ask for one.
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Paging parameters. Unparseable values fall back to the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    page: Option<String>,
    limit: Option<String>,
}

impl PageQuery {
    fn page(&self) -> u32 {
        self.page
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1)
    }

    fn limit(&self) -> u32 {
        self.limit
            .as_deref()
            .and_then(|l| l.parse().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveResponse {
    room_id: uuid::Uuid,
    member_count: u32,
    new_owner_id: Option<UserId>,
    archived: bool,
}

/// `POST /api/rooms`
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    ApiJson(spec): ApiJson<RoomSpec>,
) -> ApiResult<RoomView> {
    let room = state
        .hub
        .create_room(&caller.identity, spec)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(room).created())
}

/// `GET /api/rooms?page&limit`
pub async fn list_public_rooms(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Query(query): Query<PageQuery>,
) -> ApiResult<RoomPage> {
    let page = state
        .hub
        .rooms()
        .list_public_rooms(query.page(), query.limit())
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(page))
}

/// `GET /api/rooms/mine`
pub async fn list_user_rooms(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
) -> ApiResult<Vec<UserRoom>> {
    let rooms = state
        .hub
        .rooms()
        .list_user_rooms(caller.identity.user_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(rooms))
}

/// `GET /api/rooms/:id`
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<RoomView> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let room = state
        .hub
        .rooms()
        .get_room_with_stats(room_id, caller.identity.user_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(room))
}

/// `PATCH /api/rooms/:id`
pub async fn update_room(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<RoomPatch>,
) -> ApiResult<RoomView> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let snapshot = state
        .hub
        .update_room(&caller.identity, room_id, patch)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(RoomView::new(&snapshot, caller.identity.user_id)))
}

/// `DELETE /api/rooms/:id`
pub async fn delete_room(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<DeletedRoom> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let deleted = state
        .hub
        .delete_room(&caller.identity, room_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(deleted))
}

/// `POST /api/rooms/:id/join`
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<JoinOutcome> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let outcome = state
        .hub
        .join_room(&caller.identity, room_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(outcome))
}

/// `POST /api/rooms/:id/leave`
pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<LeaveResponse> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let outcome = state
        .hub
        .leave_room(&caller.identity, room_id)
        .await
        .map_err(|e| caller.fail(e))?;

    Ok(caller.ok(LeaveResponse {
        room_id: outcome.room_id,
        member_count: outcome.member_count,
        new_owner_id: outcome.new_owner,
        archived: outcome.archived,
    }))
}

/// `POST /api/rooms/:id/transfer`
pub async fn transfer_ownership(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<TransferRequest>,
) -> ApiResult<RoomView> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let snapshot = state
        .hub
        .transfer_ownership(&caller.identity, room_id, request.user_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(RoomView::new(&snapshot, caller.identity.user_id)))
}

/// `GET /api/rooms/:id/members`
pub async fn list_members(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<Vec<Membership>> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let members = state
        .hub
        .rooms()
        .list_members(room_id, caller.identity.user_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(members))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_defaults() {
        let query = PageQuery::default();
        assert_eq!(query.page(), 1);
        assert_eq!(query.limit(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_page_query_ignores_garbage() {
        let query = PageQuery {
            page: Some("three".into()),
            limit: Some("5".into()),
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.limit(), 5);
    }
}
