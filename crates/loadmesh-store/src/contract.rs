//! The datastore contract.
//!
//! Modeled on the minimal command set the fabric needs: keyed values
//! with TTLs for load gossip, and pub/sub with delivery counting for
//! the RPC transport. Concrete backends (Redis, in-memory) live behind
//! this trait; the core never constructs its own clients.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::StoreResult;

/// Health of the datastore connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

impl ConnectionState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Online)
    }
}

/// A key/value + pub/sub datastore shared by all nodes in a pool.
///
/// Implementations must deliver subscribed messages on a receiver that
/// carries no other traffic (the subscribe connection is dedicated),
/// and `publish` must report the number of subscribers the message was
/// delivered to.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl` if given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Get the value under `key`, if present and unexpired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Get many keys at once; the result is positional.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// List keys matching `pattern`. Only `prefix*` suffix globs and
    /// exact keys are supported; that is all the fabric uses.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Delete `key`. Returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Publish `message` on `channel`, returning how many subscribers
    /// received it.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    /// Subscribe to the given channels on a dedicated receiver.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription>;

    /// Observe connection health. The receiver yields the current
    /// state immediately and on every transition thereafter.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// A live subscription yielding `(channel, message)` pairs.
pub struct Subscription {
    rx: mpsc::Receiver<(String, String)>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<(String, String)>) -> Self {
        Self { rx }
    }

    /// Receive the next message, or `None` once the backend closes the
    /// subscription.
    pub async fn next(&mut self) -> Option<(String, String)> {
        self.rx.recv().await
    }
}

/// Match `key` against the restricted pattern syntax: a trailing `*`
/// matches any suffix, anything else is an exact comparison.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_glob_matches_prefix() {
        assert!(key_matches("RDB:global:*", "RDB:global:abc12"));
        assert!(key_matches("*", "anything"));
        assert!(!key_matches("RDB:global:*", "RDB:other:abc12"));
    }

    #[test]
    fn bare_pattern_is_exact() {
        assert!(key_matches("RDB:global:abc12", "RDB:global:abc12"));
        assert!(!key_matches("RDB:global:abc12", "RDB:global:abc13"));
    }

    #[test]
    fn connection_state_predicate() {
        assert!(ConnectionState::Online.is_online());
        assert!(!ConnectionState::Offline.is_online());
    }
}
