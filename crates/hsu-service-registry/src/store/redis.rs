//! Redis store backend.
//!
//! Commands go through a shared `ConnectionManager` (reconnects on its
//! own); every subscription opens a dedicated pub/sub connection whose
//! messages are forwarded into the [`Subscription`] by a background task.
//! Dropping the subscription stops the task, which closes the connection.

use super::{KvStore, Subscription};
use crate::config::StoreConfig;
use async_trait::async_trait;
use futures::StreamExt;
use hsu_common::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Redis-backed implementation of [`KvStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection_manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

fn store_err(context: &str, e: redis::RedisError) -> Error {
    Error::store(format!("{}: {}", context, e))
}

fn ttl_millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    /// Connects to the store described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        Self::open(&config.redis_url()).await
    }

    /// Connects to a `redis://` URL.
    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| store_err("Failed to create Redis client", e))?;

        let connection_manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| store_err("Failed to connect to Redis", e))?;

        debug!(addr = ?client.get_connection_info().addr, "Connected to Redis");

        Ok(Self {
            client,
            connection_manager,
        })
    }

    async fn forward_messages(
        pubsub: redis::aio::PubSub,
        tx: mpsc::UnboundedSender<String>,
        topics: Vec<String>,
    ) {
        let mut messages = Box::pin(pubsub.into_on_message());
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(topics = ?topics, "Subscription dropped, closing pubsub connection");
                    break;
                }
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!(topics = ?topics, "Redis pubsub connection closed");
                        break;
                    };
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(channel = %msg.get_channel_name(), error = %e, "Dropping non-text pubsub payload");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to set key", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to get key", e))
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !members.is_empty() {
            pipe.cmd("SADD").arg(key).arg(members).ignore();
        }
        pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to update set", e))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to read set", e))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        let mut keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to list keys", e))?;
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to delete keys", e))?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to publish", e))
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| store_err("Failed to open pubsub connection", e))?;

        for topic in topics {
            pubsub
                .subscribe(topic)
                .await
                .map_err(|e| store_err("Failed to subscribe", e))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::forward_messages(pubsub, tx, topics.to_vec()));

        Ok(Subscription::new(topics.to_vec(), rx))
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("Failed to flush database", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_bad_url() {
        let err = RedisStore::open("not-a-url").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }
}
