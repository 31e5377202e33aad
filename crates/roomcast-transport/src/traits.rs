//! The seam between the registry and concrete transports.
//!
//! The registry holds a [`ConnectionSink`] per client. It can ask whether the
//! client still accepts frames, hand it an already encoded frame, and close
//! it. Socket handling stays on the transport side.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Process-local handle for one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh `conn_`-prefixed identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a frame could not be moved to or from a client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client is gone or the writer has stopped.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The client's outbound queue is full.
    #[error("Outbound queue full")]
    Backpressure,

    /// The socket returned an error while reading.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Write side of a live client.
///
/// `send_text` must not wait on the network. A sink that cannot take the
/// frame right away reports [`TransportError::Backpressure`] instead.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// False once the client has gone away or close has been requested.
    fn is_writable(&self) -> bool;

    /// Enqueue one encoded text frame.
    fn send_text(&self, text: Arc<str>) -> Result<(), TransportError>;

    /// Stop the connection. A `notice` frame, if given, is written before
    /// the close frame.
    async fn close(&self, notice: Option<Arc<str>>) -> Result<(), TransportError>;

    /// Peer address, when the transport knows it.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
        assert_eq!(a.as_str().len(), "conn_".len() + 32);
    }

    #[test]
    fn test_display_matches_inner_value() {
        let id = ConnectionId::new("edge-7");
        assert_eq!(id.to_string(), "edge-7");
        assert_eq!(id.as_str(), "edge-7");
    }
}
