//! Liveness and counters.

use axum::extract::State;
use roomcast_core::HubStats;
use serde::Serialize;
use std::sync::Arc;

use crate::api::{ApiOk, ApiResult, RequestId};
use crate::auth::Caller;
use crate::routes::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    status: &'static str,
    version: &'static str,
    node_id: String,
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>, request_id: RequestId) -> ApiOk<Health> {
    let status = if *state.shutdown.borrow() {
        "draining"
    } else {
        "ok"
    };

    ApiOk::new(
        request_id,
        Health {
            status,
            version: env!("CARGO_PKG_VERSION"),
            node_id: state.hub.bus().node_id().to_string(),
        },
    )
}

/// `GET /api/stats`
pub async fn stats(State(state): State<Arc<AppState>>, caller: Caller) -> ApiResult<HubStats> {
    Ok(caller.ok(state.hub.stats()))
}
