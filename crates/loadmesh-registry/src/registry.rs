//! The per-node registry client: reporter task and throttled reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use loadmesh_store::{ConnectionState, Datastore};

use crate::error::RegistryResult;

/// Minimum spacing between two load writes (trailing-edge coalescing).
pub const REPORT_THROTTLE: Duration = Duration::from_secs(1);

/// Minimum spacing between two real peer-load reads.
pub const FETCH_THROTTLE: Duration = Duration::from_secs(1);

struct FetchCache {
    loads: HashMap<String, u64>,
    fetched_at: Option<Instant>,
}

/// Per-node load registry client.
///
/// Owns a background reporter that mirrors the consumer's load watch
/// into the node's TTL'd key, and a throttled read path over every
/// peer's key.
pub struct LoadRegistry {
    store: Arc<dyn Datastore>,
    node_id: String,
    /// This node's load key.
    key: String,
    /// Glob matching every load key in the pool.
    pattern: String,
    /// Key prefix stripped to recover peer ids.
    prefix: String,
    report_interval: Duration,
    cache: Mutex<FetchCache>,
    connection: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl LoadRegistry {
    pub fn new(
        store: Arc<dyn Datastore>,
        pool_id: &str,
        node_id: &str,
        report_interval: Duration,
    ) -> Self {
        let prefix = format!("RDB:{pool_id}:");
        let connection = store.connection_state();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            node_id: node_id.to_string(),
            key: format!("{prefix}{node_id}"),
            pattern: format!("{prefix}*"),
            prefix,
            report_interval,
            cache: Mutex::new(FetchCache {
                loads: HashMap::new(),
                fetched_at: None,
            }),
            connection,
            shutdown_tx,
            reporter: Mutex::new(None),
        }
    }

    /// Start the reporter task mirroring `load` into the datastore.
    ///
    /// An initial report is written immediately; afterwards a write
    /// happens on every load change (throttled, trailing edge), every
    /// `report_interval` regardless, and once right after each
    /// reconnect.
    pub async fn start_reporter(&self, load: watch::Receiver<u64>) {
        let task = run_reporter(
            Arc::clone(&self.store),
            self.key.clone(),
            self.report_interval,
            load,
            self.connection.clone(),
            self.shutdown_tx.subscribe(),
        );
        let handle = tokio::spawn(task);
        if let Some(old) = self.reporter.lock().await.replace(handle) {
            old.abort();
        }
        info!(node_id = %self.node_id, interval = ?self.report_interval, "load reporter started");
    }

    /// Fetch every node's last reported load, keyed by node id.
    ///
    /// At most one real read per [`FETCH_THROTTLE`]; calls inside the
    /// window get the cached map. Values that fail to parse as
    /// non-negative integers are skipped.
    pub async fn fetch_loads(&self) -> RegistryResult<HashMap<String, u64>> {
        let mut cache = self.cache.lock().await;
        if let Some(at) = cache.fetched_at {
            if at.elapsed() < FETCH_THROTTLE {
                return Ok(cache.loads.clone());
            }
        }

        let keys = self.store.keys(&self.pattern).await?;
        let values = self.store.mget(&keys).await?;

        let mut loads = HashMap::new();
        for (key, value) in keys.iter().zip(values) {
            let Some(peer) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let Some(value) = value else { continue };
            match value.parse::<u64>() {
                Ok(load) => {
                    loads.insert(peer.to_string(), load);
                }
                Err(_) => warn!(%key, %value, "skipping unparseable load value"),
            }
        }

        cache.loads = loads.clone();
        cache.fetched_at = Some(Instant::now());
        Ok(loads)
    }

    /// Whether the datastore connection is currently up.
    pub fn is_online(&self) -> bool {
        self.connection.borrow().is_online()
    }

    /// Observe connection transitions (online/offline signals).
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Delete this node's load key (close path).
    pub async fn remove(&self) {
        match self.store.del(&self.key).await {
            Ok(_) => debug!(key = %self.key, "load key removed"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to remove load key"),
        }
    }

    /// Stop the reporter task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reporter.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// The reporter loop.
async fn run_reporter(
    store: Arc<dyn Datastore>,
    key: String,
    report_interval: Duration,
    mut load: watch::Receiver<u64>,
    mut connection: watch::Receiver<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_write: Option<Instant> = None;

    loop {
        tokio::select! {
            // Lower bound on freshness: the key's TTL equals the
            // report interval, so this tick renews it. The first tick
            // fires immediately and doubles as the startup report.
            _ = ticker.tick() => {
                write_load(&store, &key, &mut load, report_interval).await;
                last_write = Some(Instant::now());
            }
            changed = load.changed() => {
                if changed.is_err() {
                    debug!(%key, "load source dropped, reporter stopping");
                    break;
                }
                // Trailing-edge throttle: absorb further changes until
                // the window ends, then write the latest value.
                if let Some(at) = last_write {
                    let window_end = at + REPORT_THROTTLE;
                    while Instant::now() < window_end {
                        tokio::select! {
                            _ = tokio::time::sleep_until(window_end) => break,
                            changed = load.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                write_load(&store, &key, &mut load, report_interval).await;
                last_write = Some(Instant::now());
                ticker.reset();
            }
            changed = connection.changed() => {
                if changed.is_ok() && connection.borrow().is_online() {
                    info!(%key, "datastore back online, reporting fresh load");
                    write_load(&store, &key, &mut load, report_interval).await;
                    last_write = Some(Instant::now());
                    ticker.reset();
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn write_load(
    store: &Arc<dyn Datastore>,
    key: &str,
    load: &mut watch::Receiver<u64>,
    ttl: Duration,
) {
    let value = *load.borrow_and_update();
    match store.set(key, &value.to_string(), Some(ttl)).await {
        Ok(()) => debug!(%key, load = value, "load reported"),
        Err(e) => debug!(%key, error = %e, "load report skipped"),
    }
}
