//! Room event broker on Redis pub/sub.
//!
//! Publishes go through the shared managed connection. The subscription uses
//! a dedicated pub/sub connection with `PSUBSCRIBE roomcast:room:*`, and is
//! re-established with backoff if Redis drops it, so the feed handed to the
//! fan-out bus stays open for the life of the process.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use roomcast_core::bus::{DEFAULT_FEED_CAPACITY, ROOM_CHANNEL_PATTERN};
use roomcast_core::{Broker, BrokerError, BrokerFeed, BrokerMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Broker shared by all processes through Redis.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    feed_capacity: usize,
}

impl RedisBroker {
    #[must_use]
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }

    async fn open_subscription(client: &redis::Client) -> redis::RedisResult<redis::aio::PubSub> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(ROOM_CHANNEL_PATTERN).await?;
        Ok(pubsub)
    }
}

/// Forward messages until the subscription drops. Returns `false` once the
/// feed's receiver is gone.
async fn forward(pubsub: redis::aio::PubSub, tx: &mpsc::Sender<BrokerMessage>) -> bool {
    let mut stream = pubsub.into_on_message();
    while let Some(msg) = stream.next().await {
        let message = BrokerMessage {
            channel: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        };
        if tx.send(message).await.is_err() {
            return false;
        }
    }
    true
}

async fn resubscribe_loop(client: redis::Client, first: redis::aio::PubSub, tx: mpsc::Sender<BrokerMessage>) {
    let mut pubsub = Some(first);
    let mut backoff = RECONNECT_INITIAL;

    loop {
        if let Some(active) = pubsub.take() {
            if !forward(active, &tx).await {
                debug!("Broker feed dropped, stopping subscription");
                return;
            }
            warn!("Broker subscription lost, reconnecting");
        }

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = tx.closed() => return,
        }

        match RedisBroker::open_subscription(&client).await {
            Ok(fresh) => {
                info!(pattern = ROOM_CHANNEL_PATTERN, "Broker subscription restored");
                pubsub = Some(fresh);
                backoff = RECONNECT_INITIAL;
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?backoff, "Broker resubscribe failed");
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn
            .publish(channel, payload.as_ref())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BrokerFeed, BrokerError> {
        let pubsub = Self::open_subscription(&self.client)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let (tx, feed) = BrokerFeed::channel(self.feed_capacity);
        tokio::spawn(resubscribe_loop(self.client.clone(), pubsub, tx));
        Ok(feed)
    }
}
