//! HTTP routes and shared application state.

use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Router};
use roomcast_core::Hub;
use roomcast_transport::WebSocketConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers;
use crate::middleware;

/// State shared by every handler.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Config,
    /// Flips to `true` when the server starts shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Arc<Hub>, config: Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            hub,
            config,
            shutdown,
        }
    }

    /// WebSocket settings from the transport configuration.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.config.transport.max_message_size,
            outbound_queue: self.config.transport.outbound_queue,
            write_timeout: Duration::from_millis(self.config.heartbeat.timeout_ms),
            ping_interval: Duration::from_millis(self.config.heartbeat.interval_ms),
        }
    }
}

/// Build the application router.
///
/// Layer order, outermost first: request id, HTTP metrics, tracing.
pub fn build_routes(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    let rooms = Router::new()
        .route(
            "/",
            post(handlers::rooms::create_room).get(handlers::rooms::list_public_rooms),
        )
        .route("/mine", get(handlers::rooms::list_user_rooms))
        .route(
            "/:id",
            get(handlers::rooms::get_room)
                .patch(handlers::rooms::update_room)
                .delete(handlers::rooms::delete_room),
        )
        .route("/:id/join", post(handlers::rooms::join_room))
        .route("/:id/leave", post(handlers::rooms::leave_room))
        .route("/:id/transfer", post(handlers::rooms::transfer_ownership))
        .route("/:id/members", get(handlers::rooms::list_members))
        .route(
            "/:id/invites",
            post(handlers::invites::generate_invite).get(handlers::invites::list_invites),
        );

    let invites = Router::new()
        .route(
            "/:token",
            get(handlers::invites::validate_invite).delete(handlers::invites::revoke_invite),
        )
        .route("/:token/redeem", post(handlers::invites::redeem_invite));

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/stats", get(handlers::health::stats))
        .nest("/api/rooms", rooms)
        .nest("/api/invites", invites)
        .route(&ws_path, get(handlers::ws::upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(axum_middleware::from_fn(middleware::http_metrics))
        .layer(axum_middleware::from_fn(middleware::request_id))
}
