//! Invite endpoints.

use axum::extract::{Path, State};
use roomcast_core::invite::Redemption;
use roomcast_core::{InviteOptions, InviteRecord, TokenValidation};
use serde::Serialize;
use std::sync::Arc;

use crate::api::{parse_room_id, ApiJson, ApiResult};
use crate::auth::{Authenticated, Caller};
use crate::routes::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invite: Option<InviteRecord>,
}

impl From<TokenValidation> for Validation {
    fn from(validation: TokenValidation) -> Self {
        match validation {
            TokenValidation::Valid(record) => Self {
                valid: true,
                reason: None,
                invite: Some(record),
            },
            TokenValidation::Invalid(reason) => Self {
                valid: false,
                reason: Some(reason.as_str()),
                invite: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Revoked {
    revoked: bool,
}

/// `POST /api/rooms/:id/invites`
pub async fn generate_invite(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
    ApiJson(options): ApiJson<InviteOptions>,
) -> ApiResult<InviteRecord> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let invite = state
        .hub
        .generate_invite(&caller.identity, room_id, options)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(invite).created())
}

/// `GET /api/rooms/:id/invites`
pub async fn list_invites(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<Vec<InviteRecord>> {
    let room_id = parse_room_id(&id).map_err(|e| caller.fail(e))?;
    let invites = state
        .hub
        .invites()
        .list_invites(room_id, caller.identity.user_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(invites))
}

/// `GET /api/invites/:token`. Open to anonymous callers so invite links can
/// be previewed before signing in.
pub async fn validate_invite(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(token): Path<String>,
) -> ApiResult<Validation> {
    let validation = state
        .hub
        .invites()
        .validate_token(&token)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(validation.into()))
}

/// `POST /api/invites/:token/redeem`
pub async fn redeem_invite(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(token): Path<String>,
) -> ApiResult<Redemption> {
    let redemption = state
        .hub
        .redeem_invite(&caller.identity, &token)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(redemption))
}

/// `DELETE /api/invites/:token`
pub async fn revoke_invite(
    State(state): State<Arc<AppState>>,
    caller: Authenticated,
    Path(token): Path<String>,
) -> ApiResult<Revoked> {
    state
        .hub
        .invites()
        .revoke(&token, caller.identity.user_id)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(caller.ok(Revoked { revoked: true }))
}
