//! In-process store backend.
//!
//! Keys live in a `DashMap` with an optional expiry instant taken from
//! `tokio::time`, so tests running with a paused clock can advance past a
//! TTL deterministically. Expired entries are treated as absent by every
//! read and removed lazily.

use super::{glob_match, KvStore, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use hsu_common::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Thread-safe in-memory key/value and pub/sub store.
///
/// Cloning shares the same data, which lets several meshes in one process
/// see each other the way separate processes would through a real store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    topics: Arc<DashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of topics with at least one registered subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drops closed subscribers of `topic`, and the topic once it has none.
    fn prune_topic(topics: &DashMap<String, Vec<mpsc::UnboundedSender<String>>>, topic: &str) {
        if let Some(mut subs) = topics.get_mut(topic) {
            subs.retain(|tx| !tx.is_closed());
        }
        topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Returns the live entry for `key`, dropping it if expired.
    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    fn wrong_type(key: &str) -> Error {
        Error::store(format!(
            "WRONGTYPE operation against key holding the wrong kind of value: {}",
            key
        ))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live_entry(key) {
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s)),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Set(set) => set.extend(members.iter().cloned()),
            Value::Str(_) => return Err(Self::wrong_type(key)),
        }
        entry.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        match self.live_entry(key) {
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.into_iter().collect()),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize> {
        let mut delivered = 0;
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|tx| tx.send(payload.to_string()).is_ok());
            delivered = subs.len();
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
        trace!(topic = %topic, delivered, "published");
        Ok(delivered)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        for topic in topics {
            self.topics.entry(topic.clone()).or_default().push(tx.clone());
        }

        let registry = Arc::clone(&self.topics);
        let owned = topics.to_vec();
        Ok(Subscription::new(topics.to_vec(), rx).on_release(move || {
            for topic in &owned {
                Self::prune_topic(&registry, topic);
            }
        }))
    }

    async fn flush(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
