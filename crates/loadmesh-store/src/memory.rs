//! In-memory datastore backend.
//!
//! Implements the full [`Datastore`] contract in-process: TTL'd keys,
//! suffix-glob listing, and pub/sub with per-subscriber receivers and
//! delivery counting. Used by the test suite and by single-process
//! deployments that do not need a shared store.
//!
//! The store can be forced offline with [`MemoryStore::set_connected`],
//! which flips the connection-state watch and makes every operation
//! fail with [`StoreError::Offline`] until reconnected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::contract::{key_matches, ConnectionState, Datastore, Subscription};
use crate::error::{StoreError, StoreResult};

/// Buffer size of each subscription's receiver. Subscribers that fall
/// this far behind stop counting as delivered.
const SUBSCRIPTION_BUFFER: usize = 256;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    /// Channel name → sender side of every live subscription.
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<(String, String)>>>>,
    state_tx: watch::Sender<ConnectionState>,
}

/// In-process datastore; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Online);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                state_tx,
            }),
        }
    }

    /// Force the connection online or offline.
    ///
    /// While offline every operation fails with [`StoreError::Offline`]
    /// and the connection-state watch reports the transition, exactly
    /// as a real client's error/reconnect signals would.
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        };
        if *self.inner.state_tx.borrow() != state {
            debug!(?state, "memory store connection state changed");
            let _ = self.inner.state_tx.send(state);
        }
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.inner.state_tx.borrow().is_online() {
            Ok(())
        } else {
            Err(StoreError::Offline)
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_online()?;
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.inner.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match entries.get(key) {
                Some(e) if e.is_live(now) => out.push(Some(e.value.clone())),
                Some(_) => {
                    entries.remove(key);
                    out.push(None);
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .keys()
            .filter(|k| key_matches(pattern, k))
            .cloned()
            .collect())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let existed = self
            .inner
            .entries
            .lock()
            .await
            .remove(key)
            .map_or(false, |e| e.is_live(now));
        Ok(existed)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.check_online()?;
        let mut channels = self.inner.channels.lock().await;
        let Some(senders) = channels.get_mut(channel) else {
            return Ok(0);
        };

        // Prune subscriptions whose receivers were dropped.
        senders.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in senders.iter() {
            if tx
                .try_send((channel.to_string(), message.to_string()))
                .is_ok()
            {
                delivered += 1;
            }
        }
        if senders.is_empty() {
            channels.remove(channel);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        self.check_online()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut map = self.inner.channels.lock().await;
        for channel in channels {
            map.entry(channel.clone()).or_default().push(tx.clone());
        }
        debug!(count = channels.len(), "subscribed to channels");
        Ok(Subscription::new(rx))
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}
