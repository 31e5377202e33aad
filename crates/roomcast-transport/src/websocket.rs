//! WebSocket transport implementation.
//!
//! Splits an upgraded axum WebSocket into a [`QueuedSink`] for the registry,
//! a writer task draining the outbound queue onto the socket, and a
//! [`WebSocketReader`] yielding inbound text frames in receipt order.
//!
//! The writer gives up on a peer that stops reading: every socket write is
//! bounded by `write_timeout`, and on expiry the writer exits. Its queue is
//! dropped with it, so the sink stops reporting itself writable and the
//! registry's idle sweep can reclaim the connection.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::queue::{queued, Outbound, OutboundQueue, QueuedSink, DEFAULT_QUEUE_CAPACITY};
use crate::traits::{ConnectionId, TransportError};

/// Normal closure status code.
const CLOSE_NORMAL: u16 = 1000;

const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub outbound_queue: usize,
    /// Upper bound on a single socket write.
    pub write_timeout: Duration,
    /// Interval between server pings.
    pub ping_interval: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            outbound_queue: DEFAULT_QUEUE_CAPACITY,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// An inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text (or UTF-8 binary) frame.
    Text(String),
    /// A frame that exceeded the size limit.
    Oversized(usize),
}

/// A split WebSocket connection.
pub struct WebSocketConnection {
    /// Registry-facing sink.
    pub sink: Arc<QueuedSink>,
    /// Inbound frames.
    pub reader: WebSocketReader,
    /// Writer task draining the outbound queue.
    pub writer: JoinHandle<()>,
}

/// Split a socket and start its writer task.
#[must_use]
pub fn accept(
    socket: WebSocket,
    id: ConnectionId,
    remote_addr: Option<String>,
    config: &WebSocketConfig,
) -> WebSocketConnection {
    let (ws_tx, ws_rx) = socket.split();
    let (sink, queue) = queued(id.clone(), config.outbound_queue);
    let sink = match remote_addr {
        Some(addr) => sink.with_remote_addr(addr),
        None => sink,
    };

    let writer = tokio::spawn(write_loop(
        id.clone(),
        ws_tx,
        queue,
        config.write_timeout,
        config.ping_interval,
    ));

    WebSocketConnection {
        sink: Arc::new(sink),
        reader: WebSocketReader {
            id,
            stream: ws_rx,
            max_message_size: config.max_message_size,
        },
        writer,
    }
}

enum Step {
    Send(Outbound),
    Ping,
    Stop,
}

async fn write_loop<S>(
    id: ConnectionId,
    mut ws_tx: S,
    mut queue: OutboundQueue,
    write_timeout: Duration,
    ping_interval: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let period = ping_interval.max(MIN_PING_INTERVAL);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            item = queue.next() => match item {
                Some(item) => Step::Send(item),
                None => Step::Stop,
            },
            _ = heartbeat.tick() => Step::Ping,
        };

        let keep_going = match step {
            Step::Stop => false,
            Step::Ping => send_within(&id, &mut ws_tx, Message::Ping(Vec::new()), write_timeout).await,
            Step::Send(Outbound::Text(text)) => {
                send_within(&id, &mut ws_tx, Message::Text(text.to_string()), write_timeout).await
            }
            Step::Send(Outbound::Close(notice)) => {
                let delivered = match notice {
                    Some(text) => {
                        send_within(&id, &mut ws_tx, Message::Text(text.to_string()), write_timeout).await
                    }
                    None => true,
                };
                if delivered {
                    let close = Message::Close(Some(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: "".into(),
                    }));
                    send_within(&id, &mut ws_tx, close, write_timeout).await;
                }
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    // Release the queue before flushing so the sink reads as closed at once.
    drop(queue);
    let _ = timeout(write_timeout, ws_tx.close()).await;
    debug!(connection = %id, "WebSocket writer stopped");
}

/// Write one message. Returns false if the socket failed or stalled.
async fn send_within<S>(id: &ConnectionId, ws_tx: &mut S, message: Message, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(limit, ws_tx.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection = %id, error = %e, "WebSocket write failed");
            false
        }
        Err(_) => {
            warn!(connection = %id, timeout_ms = limit.as_millis() as u64, "WebSocket write stalled");
            false
        }
    }
}

/// The readable half of a WebSocket connection.
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketReader {
    /// Receive the next frame.
    ///
    /// Returns `None` when the client closed the connection cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket fails.
    pub async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        return Ok(Some(Inbound::Oversized(text.len())));
                    }
                    return Ok(Some(Inbound::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        return Ok(Some(Inbound::Oversized(data.len())));
                    }
                    // For compatibility, accept UTF-8 binary frames as text
                    return Ok(Some(Inbound::Text(
                        String::from_utf8_lossy(&data).into_owned(),
                    )));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pongs are answered by the socket itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(connection = %self.id, error = %e, "WebSocket error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ConnectionSink;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    /// A peer that never reads: every write stays pending.
    struct Stalled;

    impl Sink<Message> for Stalled {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Message>>>);

    impl Recorder {
        fn taken(&self) -> Vec<Message> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl Sink<Message> for Recorder {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.0.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.outbound_queue, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_stops_writer_and_sink() {
        let id = ConnectionId::new("stalled");
        let (sink, queue) = queued(id.clone(), 1);
        let writer = tokio::spawn(write_loop(
            id,
            Stalled,
            queue,
            Duration::from_secs(5),
            Duration::from_secs(30),
        ));

        // The writer takes "a" and blocks on the socket; "b" fills the queue.
        sink.send_text(Arc::from("a")).unwrap();
        tokio::task::yield_now().await;
        sink.send_text(Arc::from("b")).unwrap();
        assert!(matches!(
            sink.send_text(Arc::from("c")),
            Err(TransportError::Backpressure)
        ));

        tokio::time::timeout(Duration::from_secs(60), writer)
            .await
            .expect("writer must give up on a stalled peer")
            .unwrap();
        assert!(!sink.is_writable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_idle_peer() {
        let id = ConnectionId::new("idle");
        let (sink, queue) = queued(id.clone(), 4);
        let peer = Recorder::default();
        let writer = tokio::spawn(write_loop(
            id,
            peer.clone(),
            queue,
            Duration::from_secs(5),
            Duration::from_secs(30),
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let sent = peer.taken();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Message::Ping(_)));

        drop(sink);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_writes_notice_then_close_frame() {
        let id = ConnectionId::new("closing");
        let (sink, queue) = queued(id.clone(), 4);
        let peer = Recorder::default();
        let writer = tokio::spawn(write_loop(
            id,
            peer.clone(),
            queue,
            Duration::from_secs(5),
            Duration::from_secs(30),
        ));

        sink.send_text(Arc::from("hello")).unwrap();
        sink.close(Some(Arc::from("bye"))).await.unwrap();
        writer.await.unwrap();

        let sent = peer.taken();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], Message::Text(t) if t == "hello"));
        assert!(matches!(&sent[1], Message::Text(t) if t == "bye"));
        assert!(matches!(&sent[2], Message::Close(Some(f)) if f.code == CLOSE_NORMAL));
        assert!(!sink.is_writable());
    }
}
