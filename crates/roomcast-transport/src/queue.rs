//! Bounded outbound queue backing every connection sink.
//!
//! A [`QueuedSink`] is the registry-facing half; the transport's writer task
//! drains the matching [`OutboundQueue`]. When the writer stops, the queue is
//! dropped and the sink reports itself as no longer writable.
//!
//! Closing never waits for queue space. If the queue is full the pending
//! frames are abandoned and the writer is told to close straight away.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::traits::{ConnectionId, ConnectionSink, TransportError};

/// Default outbound queue capacity per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// An item for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame.
    Text(Arc<str>),
    /// Close the transport, after sending the optional notice.
    Close(Option<Arc<str>>),
}

/// Create a sink and its queue.
#[must_use]
pub fn queued(id: ConnectionId, capacity: usize) -> (QueuedSink, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (abort_tx, abort_rx) = watch::channel(false);
    (
        QueuedSink {
            id,
            tx,
            abort: abort_tx,
            open: AtomicBool::new(true),
            remote_addr: None,
        },
        OutboundQueue {
            rx,
            abort: abort_rx,
            aborted: false,
        },
    )
}

/// The sending half of a connection's outbound queue.
#[derive(Debug)]
pub struct QueuedSink {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    abort: watch::Sender<bool>,
    open: AtomicBool,
    remote_addr: Option<String>,
}

impl QueuedSink {
    /// Attach the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Resolves once the writer side has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[async_trait]
impl ConnectionSink for QueuedSink {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_writable(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send_text(&self, text: Arc<str>) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.tx.try_send(Outbound::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                self.open.store(false, Ordering::SeqCst);
                TransportError::ConnectionClosed
            }
        })
    }

    async fn close(&self, notice: Option<Arc<str>>) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        debug!(connection = %self.id, "Closing connection");

        match self.tx.try_send(Outbound::Close(notice)) {
            // A closed queue means the writer is already gone.
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(connection = %self.id, "Outbound queue full, abandoning pending frames");
                self.abort.send_replace(true);
            }
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// The receiving half of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Outbound>,
    abort: watch::Receiver<bool>,
    aborted: bool,
}

impl OutboundQueue {
    /// Next item to write, or `None` once every sink handle is gone.
    ///
    /// After a forced close this yields a single bare `Close` ahead of any
    /// queued frames, then `None`.
    pub async fn next(&mut self) -> Option<Outbound> {
        if self.aborted {
            return None;
        }
        tokio::select! {
            biased;
            Ok(()) = self.abort.changed() => {
                self.aborted = true;
                Some(Outbound::Close(None))
            }
            item = self.rx.recv() => item,
        }
    }

    /// Non-blocking variant of [`OutboundQueue::next`].
    pub fn try_next(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}
