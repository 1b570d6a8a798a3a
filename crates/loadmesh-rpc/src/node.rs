//! The RPC node: one subscription, two channels, a pending-call table.
//!
//! Incoming requests are dispatched to the registered handler on their
//! own task so a slow handler never blocks the listener; responses are
//! matched against the pending table by correlation id and anything
//! unmatched (late, duplicate, foreign) is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use loadmesh_store::Datastore;

use crate::envelope::{decode_payload, Request, Response};
use crate::error::{RpcError, RpcResult};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// The local work handler invoked for each incoming request.
pub type RequestHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Pending calls awaiting a response, keyed by correlation id.
type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

/// A node endpoint on the shared pub/sub datastore.
pub struct RpcNode {
    store: Arc<dyn Datastore>,
    node_id: String,
    pool_id: String,
    default_timeout: Duration,
    pending: PendingTable,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RpcNode {
    /// Subscribe this node's two channels and start the listener.
    ///
    /// `handler` is invoked for every incoming request; its result (or
    /// error) is published back to the caller's result channel.
    pub async fn connect(
        store: Arc<dyn Datastore>,
        pool_id: &str,
        node_id: &str,
        default_timeout: Duration,
        handler: RequestHandler,
    ) -> RpcResult<Self> {
        let request_channel = request_channel(pool_id, node_id);
        let result_channel = result_channel(pool_id, node_id);
        let mut subscription = store
            .subscribe(&[request_channel.clone(), result_channel.clone()])
            .await?;

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let listener = {
            let store = Arc::clone(&store);
            let pending = Arc::clone(&pending);
            let pool_id = pool_id.to_string();
            let node_id = node_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = subscription.next() => {
                            let Some((channel, message)) = msg else {
                                debug!(%node_id, "rpc subscription closed");
                                break;
                            };
                            if channel == request_channel {
                                handle_request(&store, &pool_id, &message, &handler);
                            } else {
                                resolve_response(&pending, &message).await;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            debug!(%node_id, "rpc listener shutting down");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            store,
            node_id: node_id.to_string(),
            pool_id: pool_id.to_string(),
            default_timeout,
            pending,
            shutdown_tx,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Call `peer` with `payload`, waiting up to `timeout` (or the
    /// node default) for the response.
    ///
    /// Fails with [`RpcError::NoSuchPeer`] when the publish reaches no
    /// subscriber, and [`RpcError::CallTimeout`] when the deadline
    /// passes; on timeout the correlation id is abandoned and a late
    /// response is silently dropped by the listener.
    pub async fn call(
        &self,
        peer: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        let id = loadmesh_id::correlation_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = Request {
            id: id.clone(),
            caller: self.node_id.clone(),
            payload,
        };
        let wire = match serde_json::to_string(&request) {
            Ok(wire) => wire,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        };

        let delivered = match self
            .store
            .publish(&request_channel(&self.pool_id, peer), &wire)
            .await
        {
            Ok(delivered) => delivered,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        };
        if delivered == 0 {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::NoSuchPeer(peer.to_string()));
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(RpcError::Handler(error)),
                None => Ok(decode_payload(response.payload.unwrap_or(Value::Null))),
            },
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::CallTimeout(peer.to_string()))
            }
        }
    }

    /// Stop the listener and drop the subscription.
    ///
    /// Calls still pending a response are left to time out normally.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(listener) = self.listener.lock().await.take() {
            let _ = listener.await;
        }
        debug!(node_id = %self.node_id, "rpc node disconnected");
    }
}

/// Decode and dispatch one incoming request on its own task.
fn handle_request(store: &Arc<dyn Datastore>, pool_id: &str, message: &str, handler: &RequestHandler) {
    let request: Request = match serde_json::from_str(message) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "dropping undecodable rpc request");
            return;
        }
    };

    let store = Arc::clone(store);
    let handler = Arc::clone(handler);
    let reply_channel = result_channel(pool_id, &request.caller);
    tokio::spawn(async move {
        let payload = decode_payload(request.payload);
        let response = match handler(payload).await {
            Ok(value) => Response::ok(request.id, value),
            Err(e) => Response::err(request.id, e.to_string()),
        };

        let wire = match serde_json::to_string(&response) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "failed to encode rpc response");
                return;
            }
        };
        match store.publish(&reply_channel, &wire).await {
            Ok(0) => debug!(channel = %reply_channel, "caller gone before response"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, channel = %reply_channel, "failed to publish rpc response"),
        }
    });
}

/// Route a response to its pending call, if still outstanding.
async fn resolve_response(pending: &PendingTable, message: &str) {
    let response: Response = match serde_json::from_str(message) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "dropping undecodable rpc response");
            return;
        }
    };

    match pending.lock().await.remove(&response.id) {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => debug!(id = %response.id, "dropping late or unknown rpc response"),
    }
}

fn request_channel(pool_id: &str, node_id: &str) -> String {
    format!("RPC:{pool_id}:{node_id}")
}

fn result_channel(pool_id: &str, node_id: &str) -> String {
    format!("RPC:{pool_id}:{node_id}:result")
}
