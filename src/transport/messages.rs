use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Execution;

/// Who sent a message and which node it is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub source_node_id: String,
    pub target_node_id: String,
}

impl RoutingMetadata {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
        }
    }

    /// Routing for a reply travelling the opposite way.
    pub fn reply(&self) -> Self {
        Self {
            source_node_id: self.target_node_id.clone(),
            target_node_id: self.source_node_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskForBidRequest {
    pub routing: RoutingMetadata,
    pub execution: Execution,
    /// When false the compute node may start running as soon as it bids.
    pub wait_for_approval: bool,
}

/// Bid accepted, bid rejected and cancel requests all name one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCommand {
    pub routing: RoutingMetadata,
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAck {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidResult {
    pub routing: RoutingMetadata,
    pub execution_id: Uuid,
    pub job_id: Uuid,
    pub accepted: bool,
    /// Set when the bid was made without waiting for orchestrator approval.
    pub wait_for_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub routing: RoutingMetadata,
    pub execution_id: Uuid,
    pub job_id: Uuid,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    pub routing: RoutingMetadata,
    pub execution_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeFailure {
    pub routing: RoutingMetadata,
    pub execution_id: Uuid,
    pub job_id: Uuid,
    pub error: String,
}
