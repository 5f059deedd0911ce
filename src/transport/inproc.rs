//! In-process substrate.
//!
//! An [`InProcNetwork`] is the shared fabric: a registry of per-node inboxes
//! plus one broadcast topic for node info. Each node attaches to it through
//! its own [`InProcTransport`]. Calls are routed by the target node id in the
//! request's [`RoutingMetadata`](crate::transport::RoutingMetadata), bounded
//! by the configured call timeout, and tracked so that closing a node drains
//! what it is already handling.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::TransportConfig;
use crate::models::NodeInfo;
use crate::routing::{NodeInfoConsumer, NodeInfoStore};
use crate::transport::messages::{
    AskForBidRequest, BidResult, CancelResult, ComputeFailure, ExecutionAck, ExecutionCommand,
    RunResult,
};
use crate::transport::pubsub::InProcPubSub;
use crate::transport::{
    same_handler, ComputeCallback, ComputeEndpoint, ConnectionInfo, DebugInfo, DebugInfoProvider,
    NodeInfoDecorator, PubSub, TransportError, TransportLayer,
};

pub const SUBSTRATE: &str = "inproc";

/// Handlers and in-flight bookkeeping for one attached node.
struct Inbox {
    node_id: String,
    endpoint: RwLock<Option<Arc<dyn ComputeEndpoint>>>,
    callback: RwLock<Option<Arc<dyn ComputeCallback>>>,
    closed: CancellationToken,
    in_flight: TaskTracker,
}

impl Inbox {
    fn new(node_id: String) -> Self {
        Self {
            node_id,
            endpoint: RwLock::new(None),
            callback: RwLock::new(None),
            closed: CancellationToken::new(),
            in_flight: TaskTracker::new(),
        }
    }

    fn endpoint(&self) -> Result<Arc<dyn ComputeEndpoint>, TransportError> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                TransportError::Unavailable(format!(
                    "node {} has no compute endpoint registered",
                    self.node_id
                ))
            })
    }

    fn callback(&self) -> Result<Arc<dyn ComputeCallback>, TransportError> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                TransportError::Unavailable(format!(
                    "node {} has no compute callback registered",
                    self.node_id
                ))
            })
    }

    /// Run an inbound call unless the node is closing.
    async fn dispatch<T, F>(&self, call_timeout: Duration, call: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if self.closed.is_cancelled() {
            return Err(TransportError::Unavailable(format!(
                "node {} is shutting down",
                self.node_id
            )));
        }
        match tokio::time::timeout(call_timeout, self.in_flight.track_future(call)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(call_timeout)),
        }
    }
}

fn register<H: ?Sized>(
    slot: &RwLock<Option<Arc<H>>>,
    handler: Arc<H>,
    what: &str,
    node_id: &str,
) -> Result<(), TransportError> {
    let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
    match slot.as_ref() {
        Some(existing) if same_handler(existing, &handler) => Ok(()),
        Some(_) => Err(TransportError::InvalidRegistration(format!(
            "a different {what} is already registered on node {node_id}"
        ))),
        None => {
            *slot = Some(handler);
            tracing::debug!(node_id, what, "Handler registered");
            Ok(())
        }
    }
}

/// Shared in-process fabric.
pub struct InProcNetwork {
    inboxes: RwLock<HashMap<String, Arc<Inbox>>>,
    node_info: InProcPubSub<NodeInfo>,
}

impl InProcNetwork {
    pub fn new(config: &TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            inboxes: RwLock::new(HashMap::new()),
            node_info: InProcPubSub::new(config.pubsub_capacity),
        })
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn attach(&self, node_id: &str) -> Result<Arc<Inbox>, TransportError> {
        let mut inboxes = self.inboxes.write().unwrap_or_else(PoisonError::into_inner);
        if inboxes.contains_key(node_id) {
            return Err(TransportError::InvalidRegistration(format!(
                "node {node_id} is already attached"
            )));
        }
        let inbox = Arc::new(Inbox::new(node_id.to_string()));
        inboxes.insert(node_id.to_string(), inbox.clone());
        Ok(inbox)
    }

    fn detach(&self, node_id: &str) {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id);
    }

    fn route(&self, node_id: &str) -> Result<Arc<Inbox>, TransportError> {
        self.inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
            .ok_or_else(|| TransportError::NoRoute(node_id.to_string()))
    }
}

/// Outbound side shared by both proxies.
struct Outbound {
    network: Arc<InProcNetwork>,
    local: Arc<Inbox>,
    call_timeout: Duration,
}

impl Outbound {
    fn target(&self, node_id: &str) -> Result<Arc<Inbox>, TransportError> {
        if self.local.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.network.route(node_id)
    }
}

struct InProcComputeProxy(Outbound);

#[async_trait]
impl ComputeEndpoint for InProcComputeProxy {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<ExecutionAck, TransportError> {
        let target = self.0.target(&request.routing.target_node_id)?;
        let endpoint = target.endpoint()?;
        target
            .dispatch(self.0.call_timeout, endpoint.ask_for_bid(request))
            .await
    }

    async fn bid_accepted(
        &self,
        request: ExecutionCommand,
    ) -> Result<ExecutionAck, TransportError> {
        let target = self.0.target(&request.routing.target_node_id)?;
        let endpoint = target.endpoint()?;
        target
            .dispatch(self.0.call_timeout, endpoint.bid_accepted(request))
            .await
    }

    async fn bid_rejected(
        &self,
        request: ExecutionCommand,
    ) -> Result<ExecutionAck, TransportError> {
        let target = self.0.target(&request.routing.target_node_id)?;
        let endpoint = target.endpoint()?;
        target
            .dispatch(self.0.call_timeout, endpoint.bid_rejected(request))
            .await
    }

    async fn cancel_execution(
        &self,
        request: ExecutionCommand,
    ) -> Result<ExecutionAck, TransportError> {
        let target = self.0.target(&request.routing.target_node_id)?;
        let endpoint = target.endpoint()?;
        target
            .dispatch(self.0.call_timeout, endpoint.cancel_execution(request))
            .await
    }
}

struct InProcCallbackProxy(Outbound);

#[async_trait]
impl ComputeCallback for InProcCallbackProxy {
    async fn on_bid_complete(&self, result: BidResult) -> Result<(), TransportError> {
        let target = self.0.target(&result.routing.target_node_id)?;
        let callback = target.callback()?;
        target
            .dispatch(self.0.call_timeout, callback.on_bid_complete(result))
            .await
    }

    async fn on_run_complete(&self, result: RunResult) -> Result<(), TransportError> {
        let target = self.0.target(&result.routing.target_node_id)?;
        let callback = target.callback()?;
        target
            .dispatch(self.0.call_timeout, callback.on_run_complete(result))
            .await
    }

    async fn on_cancel_complete(&self, result: CancelResult) -> Result<(), TransportError> {
        let target = self.0.target(&result.routing.target_node_id)?;
        let callback = target.callback()?;
        target
            .dispatch(self.0.call_timeout, callback.on_cancel_complete(result))
            .await
    }

    async fn on_compute_failure(&self, failure: ComputeFailure) -> Result<(), TransportError> {
        let target = self.0.target(&failure.routing.target_node_id)?;
        let callback = target.callback()?;
        target
            .dispatch(self.0.call_timeout, callback.on_compute_failure(failure))
            .await
    }
}

/// Tags node info with the in-process address of the publishing node.
struct InProcDecorator {
    node_id: String,
}

impl NodeInfoDecorator for InProcDecorator {
    fn decorate(&self, mut info: NodeInfo) -> NodeInfo {
        info.transport
            .insert("substrate".to_string(), SUBSTRATE.to_string());
        info.transport
            .insert("address".to_string(), format!("{SUBSTRATE}://{}", self.node_id));
        info
    }
}

struct InProcDebugInfo {
    network: Arc<InProcNetwork>,
    inbox: Arc<Inbox>,
}

impl DebugInfoProvider for InProcDebugInfo {
    fn debug_info(&self) -> DebugInfo {
        let endpoint = self.inbox.endpoint().is_ok();
        let callback = self.inbox.callback().is_ok();
        DebugInfo::new(
            "inproc_transport",
            serde_json::json!({
                "node_id": self.inbox.node_id,
                "closed": self.inbox.closed.is_cancelled(),
                "in_flight": self.inbox.in_flight.len(),
                "compute_endpoint_registered": endpoint,
                "compute_callback_registered": callback,
                "attached_nodes": self.network.node_ids(),
            }),
        )
    }
}

pub struct InProcTransport {
    node_id: String,
    config: TransportConfig,
    network: Arc<InProcNetwork>,
    inbox: Arc<Inbox>,
    compute_proxy: Arc<InProcComputeProxy>,
    callback_proxy: Arc<InProcCallbackProxy>,
    node_info: Arc<InProcPubSub<NodeInfo>>,
    decorator: Arc<InProcDecorator>,
    consumers: Mutex<Vec<Arc<dyn NodeInfoStore>>>,
}

impl InProcTransport {
    /// Attach `node_id` to `network`. Node ids are unique per network.
    pub fn new(
        network: Arc<InProcNetwork>,
        node_id: impl Into<String>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let node_id = node_id.into();
        let inbox = network.attach(&node_id)?;
        let outbound = || Outbound {
            network: network.clone(),
            local: inbox.clone(),
            call_timeout: config.call_timeout,
        };

        tracing::info!(node_id = %node_id, substrate = SUBSTRATE, "Transport attached");
        Ok(Self {
            compute_proxy: Arc::new(InProcComputeProxy(outbound())),
            callback_proxy: Arc::new(InProcCallbackProxy(outbound())),
            node_info: Arc::new(network.node_info.handle()),
            decorator: Arc::new(InProcDecorator {
                node_id: node_id.clone(),
            }),
            consumers: Mutex::new(Vec::new()),
            node_id,
            config,
            network,
            inbox,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl TransportLayer for InProcTransport {
    fn compute_proxy(&self) -> Arc<dyn ComputeEndpoint> {
        self.compute_proxy.clone()
    }

    fn callback_proxy(&self) -> Arc<dyn ComputeCallback> {
        self.callback_proxy.clone()
    }

    fn node_info_pubsub(&self) -> Arc<dyn PubSub<NodeInfo>> {
        self.node_info.clone()
    }

    fn node_info_decorator(&self) -> Arc<dyn NodeInfoDecorator> {
        self.decorator.clone()
    }

    fn debug_info_providers(&self) -> Vec<Arc<dyn DebugInfoProvider>> {
        vec![Arc::new(InProcDebugInfo {
            network: self.network.clone(),
            inbox: self.inbox.clone(),
        })]
    }

    async fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            substrate: SUBSTRATE.to_string(),
            node_id: self.node_id.clone(),
            address: format!("{SUBSTRATE}://{}", self.node_id),
            peers: self
                .network
                .node_ids()
                .into_iter()
                .filter(|id| *id != self.node_id)
                .collect(),
        }
    }

    async fn register_node_info_consumer(
        &self,
        store: Arc<dyn NodeInfoStore>,
    ) -> Result<(), TransportError> {
        let mut consumers = self.consumers.lock().await;
        if consumers.iter().any(|c| same_handler(c, &store)) {
            return Ok(());
        }
        self.node_info
            .subscribe(Arc::new(NodeInfoConsumer::new(store.clone())))
            .await?;
        consumers.push(store);
        tracing::debug!(node_id = %self.node_id, "Node info consumer registered");
        Ok(())
    }

    async fn register_compute_callback(
        &self,
        callback: Arc<dyn ComputeCallback>,
    ) -> Result<(), TransportError> {
        if self.inbox.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        register(&self.inbox.callback, callback, "compute callback", &self.node_id)
    }

    async fn register_compute_endpoint(
        &self,
        endpoint: Arc<dyn ComputeEndpoint>,
    ) -> Result<(), TransportError> {
        if self.inbox.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        register(&self.inbox.endpoint, endpoint, "compute endpoint", &self.node_id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inbox.closed.is_cancelled() {
            return Ok(());
        }
        tracing::info!(node_id = %self.node_id, "Closing transport");

        self.inbox.closed.cancel();
        self.inbox.in_flight.close();
        let drained = tokio::time::timeout(self.config.close_timeout, self.inbox.in_flight.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                node_id = %self.node_id,
                in_flight = self.inbox.in_flight.len(),
                "Transport closed with calls still in flight"
            );
        }

        self.node_info.close().await;
        self.network.detach(&self.node_id);
        Ok(())
    }
}
