use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Orchestrator,
    Compute,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Orchestrator => write!(f, "orchestrator"),
            NodeType::Compute => write!(f, "compute"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub gpu: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeNodeInfo {
    pub execution_engines: Vec<String>,
    pub max_capacity: Resources,
    pub available_capacity: Resources,
    pub running_executions: u32,
    pub enqueued_executions: u32,
}

/// Capability and capacity snapshot a node publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeNodeInfo>,
    /// Addressing data attached by the transport's decorator.
    #[serde(default)]
    pub transport: BTreeMap<String, String>,
    pub version: String,
    pub seen_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn compute(node_id: impl Into<String>, compute: ComputeNodeInfo) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: NodeType::Compute,
            labels: BTreeMap::new(),
            compute: Some(compute),
            transport: BTreeMap::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            seen_at: Utc::now(),
        }
    }

    pub fn orchestrator(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: NodeType::Orchestrator,
            labels: BTreeMap::new(),
            compute: None,
            transport: BTreeMap::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            seen_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}
