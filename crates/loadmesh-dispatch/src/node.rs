//! Node assembly: one process in the pool.
//!
//! `Node::start` builds the whole stack and wires it together. The
//! components only ever meet through contracts: the RPC request
//! handler closes over the consumer, the registry's reporter watches
//! the scheduler's load channel, and the dispatcher owns the routing
//! decision. Nothing holds a back-reference.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use loadmesh_registry::LoadRegistry;
use loadmesh_rpc::{RequestHandler, RpcNode};
use loadmesh_scheduler::{
    FullNotifier, IdleReaper, JobCapability, MatchRequest, MatchResponse, Scheduler,
    SchedulerConfig, WorkloadFactory,
};
use loadmesh_store::Datastore;

use crate::config::NodeConfig;
use crate::dispatcher::{Consumer, Dispatcher};
use crate::error::{DispatchError, DispatchResult};

/// Adapter: the scheduler as the dispatcher's consumer.
///
/// Requests cross the dispatch/RPC boundary as opaque JSON; this is
/// where they become typed match requests.
struct SchedulerConsumer {
    scheduler: Scheduler,
}

#[async_trait]
impl Consumer for SchedulerConsumer {
    fn load(&self) -> u64 {
        self.scheduler.load()
    }

    async fn consume(&self, payload: Value) -> anyhow::Result<Value> {
        let request: MatchRequest = serde_json::from_value(payload)?;
        let response = self.scheduler.consume(request).await?;
        Ok(serde_json::to_value(response)?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.scheduler.close().await?;
        Ok(())
    }
}

/// One running node: id, transport, registry, scheduler, dispatcher.
pub struct Node {
    id: String,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
}

impl Node {
    /// Start a node on `store`, serving `factory`'s workload.
    ///
    /// Every job the node creates gets the full-room notifier and the
    /// idle auto-destroy capability (cadence from the config), plus
    /// each extra capability in `capabilities`.
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn Datastore>,
        factory: Arc<dyn WorkloadFactory>,
        capabilities: Vec<Arc<dyn JobCapability>>,
    ) -> anyhow::Result<Node> {
        let id = loadmesh_id::node_id();

        let mut composed: Vec<Arc<dyn JobCapability>> = vec![
            Arc::new(FullNotifier),
            Arc::new(IdleReaper {
                interval: config.auto_destroy_interval(),
            }),
        ];
        composed.extend(capabilities);

        let scheduler = Scheduler::new(
            SchedulerConfig {
                concurrency: config.concurrency,
                reservation_hold: config.reservation_hold(),
                ..SchedulerConfig::default()
            },
            factory,
            composed,
        );
        let consumer: Arc<dyn Consumer> = Arc::new(SchedulerConsumer {
            scheduler: scheduler.clone(),
        });

        // Incoming RPC requests land on the local consumer directly:
        // the routing decision was already made by the calling node.
        let handler: RequestHandler = {
            let consumer = Arc::clone(&consumer);
            Arc::new(move |payload| {
                let consumer = Arc::clone(&consumer);
                Box::pin(async move { consumer.consume(payload).await })
            })
        };

        let rpc = Arc::new(
            RpcNode::connect(
                Arc::clone(&store),
                &config.pool_id,
                &id,
                config.rpc_timeout(),
                handler,
            )
            .await?,
        );

        let registry = Arc::new(LoadRegistry::new(
            Arc::clone(&store),
            &config.pool_id,
            &id,
            config.report_interval(),
        ));
        registry.start_reporter(scheduler.load_watch()).await;

        let dispatcher = Arc::new(Dispatcher::new(
            id.clone(),
            consumer,
            rpc,
            registry,
            config.rpc_timeout(),
        ));

        info!(node_id = %id, pool_id = %config.pool_id, "node started");
        Ok(Node {
            id,
            dispatcher,
            scheduler,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The node-local scheduler (job introspection, direct seat
    /// operations).
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Typed front door: dispatch a match request through the fabric.
    pub async fn consume(&self, request: MatchRequest) -> DispatchResult<MatchResponse> {
        let payload = serde_json::to_value(&request)?;
        let response = self.dispatcher.consume(payload).await?;
        serde_json::from_value(response).map_err(DispatchError::from)
    }

    /// Shut the node down: refuse new work, retract the load key,
    /// disconnect, drain.
    pub async fn close(&self) -> DispatchResult<()> {
        self.dispatcher.close().await
    }
}
