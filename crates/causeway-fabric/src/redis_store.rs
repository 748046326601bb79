//! [`SharedStore`] over a Redis server.
//!
//! Commands go through one multiplexed connection; each subscriber gets its
//! own pub/sub connection whose message stream is forwarded into a channel.

use crate::error::{StoreError, StoreResult};
use crate::store::{MessageStream, SharedStore, StoreMessage, Subscriber};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect to `url`, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url, "connected to redis");
        Ok(RedisStore {
            client,
            conn,
            closed: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> StoreResult<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(self.conn.clone())
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn()?;
        Ok(conn.hgetall(key).await?)
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        conn.pexpire::<_, ()>(key, ttl).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        Ok(conn.exists(key).await?)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        Ok(conn.smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        Ok(conn.scard(key).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        Ok(conn.publish(channel, payload).await?)
    }

    async fn subscriber(&self) -> StoreResult<(Box<dyn Subscriber>, MessageStream)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping non-text pub/sub payload");
                        continue;
                    }
                };
                let message = StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        let subscriber: Box<dyn Subscriber> = Box::new(RedisSubscriber {
            sink: Mutex::new(sink),
        });
        Ok((subscriber, rx))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RedisSubscriber {
    sink: Mutex<PubSubSink>,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        self.sink.lock().await.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        self.sink.lock().await.unsubscribe(channel).await?;
        Ok(())
    }
}
