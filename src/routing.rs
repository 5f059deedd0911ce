//! Orchestrator-side routing table built from node-info messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{NodeInfo, NodeType};
use crate::transport::{Subscriber, TransportError};

#[async_trait]
pub trait NodeInfoStore: Send + Sync {
    async fn add(&self, info: NodeInfo) -> Result<()>;

    async fn get(&self, node_id: &str) -> Option<NodeInfo>;

    async fn list(&self) -> Vec<NodeInfo>;

    async fn delete(&self, node_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct NodeEntry {
    info: NodeInfo,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryNodeInfoStore {
    nodes: RwLock<HashMap<String, NodeEntry>>,
}

impl InMemoryNodeInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute nodes not heard from for longer than `timeout` as of `now`.
    pub async fn stale_nodes(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<String> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let nodes = self.nodes.read().await;
        let mut stale: Vec<String> = nodes
            .values()
            .filter(|entry| entry.info.node_type == NodeType::Compute)
            .filter(|entry| now.signed_duration_since(entry.received_at) > timeout)
            .map(|entry| entry.info.node_id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    #[cfg(test)]
    async fn backdate(&self, node_id: &str, by: chrono::Duration) {
        if let Some(entry) = self.nodes.write().await.get_mut(node_id) {
            entry.received_at -= by;
        }
    }
}

#[async_trait]
impl NodeInfoStore for InMemoryNodeInfoStore {
    /// Keeps the newest snapshot per node; an out-of-order older snapshot
    /// still refreshes liveness.
    async fn add(&self, info: NodeInfo) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let received_at = Utc::now();
        match nodes.get_mut(&info.node_id) {
            Some(entry) => {
                if info.seen_at >= entry.info.seen_at {
                    entry.info = info;
                }
                entry.received_at = received_at;
            }
            None => {
                tracing::info!(node_id = %info.node_id, node_type = %info.node_type, "Node discovered");
                nodes.insert(info.node_id.clone(), NodeEntry { info, received_at });
            }
        }
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .map(|entry| entry.info.clone())
    }

    async fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .nodes
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        if self.nodes.write().await.remove(node_id).is_some() {
            tracing::info!(node_id, "Node removed from routing table");
        }
        Ok(())
    }
}

/// Writes every received node-info message into a [`NodeInfoStore`].
pub struct NodeInfoConsumer {
    store: Arc<dyn NodeInfoStore>,
}

impl NodeInfoConsumer {
    pub fn new(store: Arc<dyn NodeInfoStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Subscriber<NodeInfo> for NodeInfoConsumer {
    async fn handle(&self, message: NodeInfo) -> std::result::Result<(), TransportError> {
        self.store
            .add(message)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}
