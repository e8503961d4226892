//! Key/value and pub/sub adapter.
//!
//! The mesh only ever talks to the shared store through [`KvStore`]: single
//! key operations with a TTL, a prefix scan, and fire-and-forget pub/sub.
//! No multi-key transactions are needed.
//!
//! Two backends ship with the crate:
//! - [`MemoryStore`]: process-local, used by tests and single-process setups
//! - [`RedisStore`]: the shared store for real deployments

use async_trait::async_trait;
use hsu_common::Result;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Operations the mesh needs from the shared store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Sets a string value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reads a string value; `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Adds members to a set and refreshes the set's expiry to `ttl`.
    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<()>;

    /// Reads every member of a set; empty if missing or expired.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Lists live keys matching a glob (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Deletes keys, ignoring those that do not exist.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Publishes a payload; returns how many subscribers received it.
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize>;

    /// Subscribes to every topic in `topics`.
    ///
    /// Returns once the subscription is active, so anything published
    /// afterwards is delivered.
    async fn subscribe(&self, topics: &[String]) -> Result<Subscription>;

    /// Removes every key.
    async fn flush(&self) -> Result<()>;
}

/// Live subscription to one or more topics.
///
/// Dropping it releases the subscription in the backing store.
pub struct Subscription {
    topics: Vec<String>,
    rx: mpsc::UnboundedReceiver<String>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(topics: Vec<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            topics,
            rx,
            release: None,
        }
    }

    /// Runs `release` on drop, after the receiving side is closed.
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Waits for the next payload. `None` once the backend has gone away.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Senders see the channel as closed from here on.
        self.rx.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topics", &self.topics)
            .finish()
    }
}

/// Glob match supporting `*` (any run of characters, including none).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_ti = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("service:a", "service:a"));
        assert!(!glob_match("service:a", "service:b"));
        assert!(!glob_match("service:a", "service:ab"));
    }

    #[test]
    fn test_glob_wildcards() {
        let pattern = "service:*:*:presence";
        assert!(glob_match(pattern, "service:echo:abc:presence"));
        assert!(!glob_match(pattern, "service:echo:abc:health"));
        assert!(!glob_match(pattern, "other:echo:abc:presence"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*", "a"));
        assert!(glob_match("*c", "abc"));
        assert!(!glob_match("a*d", "abc"));
    }

    #[tokio::test]
    async fn test_subscription_ends_when_sender_drops() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new(vec!["t".to_string()], rx);

        tx.send("one".to_string()).unwrap();
        drop(tx);

        assert_eq!(sub.topics(), ["t".to_string()]);
        assert_eq!(sub.next().await.as_deref(), Some("one"));
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn test_release_runs_once_on_drop() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let released = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&released);
        let sub = Subscription::new(vec!["t".to_string()], rx).on_release(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(!tx.is_closed());
        drop(sub);
        assert!(tx.is_closed());
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
