//! Substrate-agnostic control plane between orchestrators and compute nodes.
//!
//! The orchestrator talks to compute nodes through a [`ComputeEndpoint`]
//! proxy; compute nodes answer through a [`ComputeCallback`] proxy; both
//! sides exchange [`NodeInfo`] snapshots over a [`PubSub`] topic. A concrete
//! substrate implements [`TransportLayer`] and is the only place that knows
//! how messages actually move. The rest of the crate depends on these traits
//! alone.
//!
//! # Substrates
//!
//! - [`inproc`]: shared in-process fabric, used for single-binary
//!   deployments and tests
//!
//! # Errors
//!
//! Every call may fail with a [`TransportError`]. Transient failures
//! ([`TransportError::is_transient`]) are retried by raising or nacking an
//! evaluation; they never fail a job directly.

pub mod inproc;
pub mod messages;
pub mod node_info;
pub mod pubsub;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::NodeInfo;
use crate::routing::NodeInfoStore;

pub use inproc::{InProcNetwork, InProcTransport};
pub use messages::{
    AskForBidRequest, BidResult, CancelResult, ComputeFailure, ExecutionAck, ExecutionCommand,
    RoutingMetadata, RunResult,
};
pub use node_info::{NodeInfoProvider, NodeInfoPublisher};
pub use pubsub::InProcPubSub;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    #[error("No route to node {0}")]
    NoRoute(String),

    #[error("Transport is closed")]
    Closed,

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Remote handler failed: {0}")]
    Remote(String),
}

impl TransportError {
    /// Timeouts, unreachable peers and unknown routes may resolve on their
    /// own; everything else needs a caller-side fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Unavailable(_) | TransportError::NoRoute(_)
        )
    }
}

/// Orchestrator → compute requests.
#[async_trait]
pub trait ComputeEndpoint: Send + Sync {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<ExecutionAck, TransportError>;

    async fn bid_accepted(&self, request: ExecutionCommand)
        -> Result<ExecutionAck, TransportError>;

    async fn bid_rejected(&self, request: ExecutionCommand)
        -> Result<ExecutionAck, TransportError>;

    async fn cancel_execution(
        &self,
        request: ExecutionCommand,
    ) -> Result<ExecutionAck, TransportError>;
}

/// Compute → orchestrator results.
#[async_trait]
pub trait ComputeCallback: Send + Sync {
    async fn on_bid_complete(&self, result: BidResult) -> Result<(), TransportError>;

    async fn on_run_complete(&self, result: RunResult) -> Result<(), TransportError>;

    async fn on_cancel_complete(&self, result: CancelResult) -> Result<(), TransportError>;

    async fn on_compute_failure(&self, failure: ComputeFailure) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Subscriber<T: Send + 'static>: Send + Sync {
    async fn handle(&self, message: T) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PubSub<T: Send + 'static>: Send + Sync {
    async fn publish(&self, message: T) -> Result<(), TransportError>;

    async fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Result<(), TransportError>;
}

/// Enriches outgoing node info with substrate-specific addressing data.
pub trait NodeInfoDecorator: Send + Sync {
    fn decorate(&self, info: NodeInfo) -> NodeInfo;
}

/// Leaves node info untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNodeInfoDecorator;

impl NodeInfoDecorator for NoopNodeInfoDecorator {
    fn decorate(&self, info: NodeInfo) -> NodeInfo {
        info
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub component: String,
    pub info: serde_json::Value,
}

impl DebugInfo {
    pub fn new(component: impl Into<String>, info: serde_json::Value) -> Self {
        Self {
            component: component.into(),
            info,
        }
    }
}

/// Read-only introspection for operator tooling.
pub trait DebugInfoProvider: Send + Sync {
    fn debug_info(&self) -> DebugInfo;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub substrate: String,
    pub node_id: String,
    pub address: String,
    pub peers: Vec<String>,
}

#[async_trait]
pub trait TransportLayer: Send + Sync {
    /// Lets the orchestrator address compute nodes.
    fn compute_proxy(&self) -> Arc<dyn ComputeEndpoint>;

    /// Lets compute nodes report back to the orchestrator that asked.
    fn callback_proxy(&self) -> Arc<dyn ComputeCallback>;

    fn node_info_pubsub(&self) -> Arc<dyn PubSub<NodeInfo>>;

    fn node_info_decorator(&self) -> Arc<dyn NodeInfoDecorator>;

    fn debug_info_providers(&self) -> Vec<Arc<dyn DebugInfoProvider>>;

    async fn connection_info(&self) -> ConnectionInfo;

    /// Feed every node-info message received by this node into `store`.
    async fn register_node_info_consumer(
        &self,
        store: Arc<dyn NodeInfoStore>,
    ) -> Result<(), TransportError>;

    /// Route compute results addressed to this node into `callback`.
    async fn register_compute_callback(
        &self,
        callback: Arc<dyn ComputeCallback>,
    ) -> Result<(), TransportError>;

    /// Route orchestrator requests addressed to this node into `endpoint`.
    async fn register_compute_endpoint(
        &self,
        endpoint: Arc<dyn ComputeEndpoint>,
    ) -> Result<(), TransportError>;

    /// Stop inbound dispatch, drain in-flight calls, release resources.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Identity of the object behind a trait object, ignoring the vtable.
pub(crate) fn same_handler<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
