//! # roomcast-transport
//!
//! Transport abstraction layer for roomcast.
//!
//! The connection registry delivers frames through the [`ConnectionSink`]
//! trait and never touches sockets directly:
//!
//! - **Queued sink** - bounded per-connection outbound queue, non-blocking sends
//! - **WebSocket** - axum WebSocket split into sink, writer task and reader
//!
//! ```rust,ignore
//! use roomcast_transport::{websocket, ConnectionId};
//!
//! let conn = websocket::accept(socket, ConnectionId::generate(), None, &config);
//! while let Ok(Some(inbound)) = conn.reader.recv().await {
//!     // Process frame
//! }
//! ```

pub mod queue;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use queue::{queued, Outbound, OutboundQueue, QueuedSink};
pub use traits::{ConnectionId, ConnectionSink, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{Inbound, WebSocketConfig, WebSocketConnection, WebSocketReader};
