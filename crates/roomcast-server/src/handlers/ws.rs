//! WebSocket endpoint.
//!
//! Each socket is registered with the hub, authenticated from the upgrade
//! request's session token, then pumped until either side closes. Closing a
//! connection from the server side (shutdown, reclaim) ends the writer task,
//! which ends this loop too.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use roomcast_protocol::{codec, ProtocolError, ServerEvent};
use roomcast_transport::{websocket, ConnectionId, ConnectionSink, Inbound, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::session_token;
use crate::routes::AppState;

/// How long to wait for the writer to flush after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /ws`
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if *state.shutdown.borrow() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let token = session_token(&headers, &uri);
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr.to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, state, token, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    token: Option<String>,
    remote_addr: Option<String>,
) {
    let id = ConnectionId::generate();
    let config = state.websocket_config();
    let WebSocketConnection {
        sink,
        mut reader,
        writer,
    } = websocket::accept(socket, id.clone(), remote_addr, &config);
    let hub = &state.hub;

    if let Err(e) = hub.open(sink.clone()) {
        warn!(connection = %id, error = %e, "Refusing connection");
        let notice = codec::encode_event(&ServerEvent::error(e.code(), e.to_string()))
            .ok()
            .map(Arc::from);
        let _ = sink.close(notice).await;
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
        return;
    }

    if token.is_some() {
        if let Err(e) = hub.authenticate(&id, token.as_deref()).await {
            debug!(connection = %id, error = %e, "Session rejected");
            let _ = hub
                .registry()
                .send_to(&id, &ServerEvent::error(e.code(), e.to_string()));
        }
    }

    loop {
        tokio::select! {
            inbound = reader.recv() => match inbound {
                Ok(Some(Inbound::Text(text))) => hub.handle_text(&id, &text).await,
                Ok(Some(Inbound::Oversized(size))) => {
                    let e = ProtocolError::FrameTooLarge(size, config.max_message_size);
                    let _ = hub
                        .registry()
                        .send_to(&id, &ServerEvent::error(e.code(), e.to_string()));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = %id, error = %e, "Read failed");
                    break;
                }
            },
            () = sink.closed() => {
                debug!(connection = %id, "Writer stopped");
                break;
            }
        }
    }

    hub.disconnect(&id).await;
    let _ = sink.close(None).await;
    drop(sink);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(connection = %id, "Writer did not stop in time");
    }
}
