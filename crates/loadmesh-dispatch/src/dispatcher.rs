//! The routing dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use loadmesh_registry::LoadRegistry;
use loadmesh_rpc::RpcNode;

use crate::error::{DispatchError, DispatchResult};

/// The dispatcher's view of the node-local consumer.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Current load; the value reported to peers.
    fn load(&self) -> u64;

    /// Handle one work request locally.
    async fn consume(&self, payload: Value) -> anyhow::Result<Value>;

    /// Refuse new work and drain; resolves when outstanding jobs are
    /// done.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Routes each request to the lowest-loaded node in the pool.
pub struct Dispatcher {
    node_id: String,
    consumer: Arc<dyn Consumer>,
    rpc: Arc<RpcNode>,
    registry: Arc<LoadRegistry>,
    rpc_timeout: Duration,
    open: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        node_id: String,
        consumer: Arc<dyn Consumer>,
        rpc: Arc<RpcNode>,
        registry: Arc<LoadRegistry>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            consumer,
            rpc,
            registry,
            rpc_timeout,
            open: AtomicBool::new(true),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Dispatch one request.
    ///
    /// Offline, tied, or minimum-at-self cases run the local consumer;
    /// otherwise the least-loaded peer is called over RPC, with an
    /// unconditional, non-retried local fallback on any RPC failure.
    pub async fn consume(&self, payload: Value) -> DispatchResult<Value> {
        if !self.is_open() {
            return Err(DispatchError::Closed);
        }

        if !self.registry.is_online() {
            debug!(node_id = %self.node_id, "datastore offline, consuming locally");
            return self.consume_local(payload).await;
        }

        let loads = match self.registry.fetch_loads().await {
            Ok(loads) => loads,
            Err(e) => {
                warn!(error = %e, "peer load fetch failed, consuming locally");
                return self.consume_local(payload).await;
            }
        };

        let local_load = self.consumer.load();
        let target = loads
            .iter()
            .filter(|(peer, _)| peer.as_str() != self.node_id)
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

        match target {
            // Strictly lower only: ties stay local to spare the hop.
            Some((peer, &peer_load)) if peer_load < local_load => {
                debug!(%peer, peer_load, local_load, "routing to least-loaded peer");
                match self
                    .rpc
                    .call(peer, payload.clone(), Some(self.rpc_timeout))
                    .await
                {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        warn!(%peer, error = %e, "peer dispatch failed, falling back to local consumer");
                        self.consume_local(payload).await
                    }
                }
            }
            _ => self.consume_local(payload).await,
        }
    }

    /// Shut the dispatcher down: refuse new work, retract the load
    /// key, disconnect the transport, drain the consumer. One-way.
    pub async fn close(&self) -> DispatchResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        info!(node_id = %self.node_id, "dispatcher closing");

        self.registry.remove().await;
        self.registry.shutdown().await;
        self.rpc.disconnect().await;
        self.consumer
            .close()
            .await
            .map_err(DispatchError::Consumer)?;

        info!(node_id = %self.node_id, "dispatcher closed");
        Ok(())
    }

    async fn consume_local(&self, payload: Value) -> DispatchResult<Value> {
        self.consumer
            .consume(payload)
            .await
            .map_err(DispatchError::Consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadmesh_rpc::RequestHandler;
    use loadmesh_store::{Datastore, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::AtomicU64;

    /// Consumer that records invocations and reports a fixed load.
    struct FixedConsumer {
        load: u64,
        calls: AtomicU64,
    }

    impl FixedConsumer {
        fn new(load: u64) -> Arc<Self> {
            Arc::new(Self {
                load,
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Consumer for FixedConsumer {
        fn load(&self) -> u64 {
            self.load
        }

        async fn consume(&self, _payload: Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"handled": "local"}))
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop_handler() -> RequestHandler {
        Arc::new(|_| Box::pin(async { Ok(json!({"handled": "peer"})) }))
    }

    async fn dispatcher_with(
        store: &MemoryStore,
        node_id: &str,
        consumer: Arc<FixedConsumer>,
    ) -> Dispatcher {
        let store: Arc<dyn Datastore> = Arc::new(store.clone());
        let rpc = Arc::new(
            RpcNode::connect(
                Arc::clone(&store),
                "global",
                node_id,
                Duration::from_secs(15),
                noop_handler(),
            )
            .await
            .unwrap(),
        );
        let registry = Arc::new(LoadRegistry::new(
            store,
            "global",
            node_id,
            Duration::from_secs(30),
        ));
        Dispatcher::new(
            node_id.to_string(),
            consumer,
            rpc,
            registry,
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn closed_dispatcher_refuses_work() {
        let store = MemoryStore::new();
        let consumer = FixedConsumer::new(0);
        let d = dispatcher_with(&store, "aaaaa", Arc::clone(&consumer)).await;

        d.close().await.unwrap();
        assert!(matches!(
            d.consume(json!({})).await,
            Err(DispatchError::Closed)
        ));
        assert_eq!(consumer.calls(), 0);

        // Closing twice reports the closed state.
        assert!(matches!(d.close().await, Err(DispatchError::Closed)));
    }

    #[tokio::test]
    async fn offline_runs_the_local_consumer_exactly_once() {
        let store = MemoryStore::new();
        let consumer = FixedConsumer::new(3);
        let d = dispatcher_with(&store, "aaaaa", Arc::clone(&consumer)).await;

        store.set_connected(false);
        let result = d.consume(json!({})).await.unwrap();
        assert_eq!(result, json!({"handled": "local"}));
        assert_eq!(consumer.calls(), 1);
    }

    #[tokio::test]
    async fn tie_with_lowest_peer_stays_local() {
        let store = MemoryStore::new();
        let consumer = FixedConsumer::new(2);
        let d = dispatcher_with(&store, "aaaaa", Arc::clone(&consumer)).await;

        // A peer with equal load exists and is subscribed; the call
        // must not go to it.
        let peer_consumer = FixedConsumer::new(2);
        let _peer = dispatcher_with(&store, "bbbbb", Arc::clone(&peer_consumer)).await;
        store.set("RDB:global:aaaaa", "2", None).await.unwrap();
        store.set("RDB:global:bbbbb", "2", None).await.unwrap();

        let result = d.consume(json!({})).await.unwrap();
        assert_eq!(result, json!({"handled": "local"}));
        assert_eq!(consumer.calls(), 1);
    }

    #[tokio::test]
    async fn lower_loaded_peer_receives_the_call() {
        let store = MemoryStore::new();
        let consumer = FixedConsumer::new(5);
        let d = dispatcher_with(&store, "aaaaa", Arc::clone(&consumer)).await;
        let _peer = dispatcher_with(&store, "bbbbb", FixedConsumer::new(0)).await;

        store.set("RDB:global:aaaaa", "5", None).await.unwrap();
        store.set("RDB:global:bbbbb", "0", None).await.unwrap();

        let result = d.consume(json!({})).await.unwrap();
        assert_eq!(result, json!({"handled": "peer"}));
        assert_eq!(consumer.calls(), 0);
    }

    #[tokio::test]
    async fn vanished_peer_falls_back_to_local() {
        let store = MemoryStore::new();
        let consumer = FixedConsumer::new(5);
        let d = dispatcher_with(&store, "aaaaa", Arc::clone(&consumer)).await;

        // A stale load entry advertises a peer that no longer
        // subscribes anywhere.
        store.set("RDB:global:ghost", "0", None).await.unwrap();

        let result = d.consume(json!({})).await.unwrap();
        assert_eq!(result, json!({"handled": "local"}));
        assert_eq!(consumer.calls(), 1);
    }

    #[tokio::test]
    async fn close_removes_the_load_key() {
        let store = MemoryStore::new();
        let d = dispatcher_with(&store, "aaaaa", FixedConsumer::new(0)).await;
        store.set("RDB:global:aaaaa", "0", None).await.unwrap();

        d.close().await.unwrap();
        assert_eq!(store.get("RDB:global:aaaaa").await.unwrap(), None);
    }
}
