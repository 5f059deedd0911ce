use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlotillaError;
use crate::models::job::{Job, DEFAULT_NAMESPACE};

/// Compute-side state of an execution, as reported by the node running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStateType {
    New,
    AskForBid,
    AskForBidAccepted,
    AskForBidRejected,
    BidAccepted,
    BidRejected,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStateType {
    pub const ALL: [ExecutionStateType; 9] = [
        ExecutionStateType::New,
        ExecutionStateType::AskForBid,
        ExecutionStateType::AskForBidAccepted,
        ExecutionStateType::AskForBidRejected,
        ExecutionStateType::BidAccepted,
        ExecutionStateType::BidRejected,
        ExecutionStateType::Completed,
        ExecutionStateType::Failed,
        ExecutionStateType::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStateType::New => "new",
            ExecutionStateType::AskForBid => "ask_for_bid",
            ExecutionStateType::AskForBidAccepted => "ask_for_bid_accepted",
            ExecutionStateType::AskForBidRejected => "ask_for_bid_rejected",
            ExecutionStateType::BidAccepted => "bid_accepted",
            ExecutionStateType::BidRejected => "bid_rejected",
            ExecutionStateType::Completed => "completed",
            ExecutionStateType::Failed => "failed",
            ExecutionStateType::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStateType::AskForBidRejected
                | ExecutionStateType::BidRejected
                | ExecutionStateType::Completed
                | ExecutionStateType::Failed
                | ExecutionStateType::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStateType {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStateType::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| FlotillaError::UnknownVariant {
                kind: "execution state",
                value: s.to_string(),
            })
    }
}

/// What the orchestrator wants the execution to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDesiredState {
    Pending,
    Running,
    Stopped,
}

impl std::fmt::Display for ExecutionDesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionDesiredState::Pending => write!(f, "pending"),
            ExecutionDesiredState::Running => write!(f, "running"),
            ExecutionDesiredState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeState {
    pub state_type: ExecutionStateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComputeState {
    pub fn new(state_type: ExecutionStateType) -> Self {
        Self {
            state_type,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub namespace: String,
    pub node_id: String,
    pub compute_state: ComputeState,
    pub desired_state: ExecutionDesiredState,
    pub revision: u64,
    pub create_time: DateTime<Utc>,
    /// Time of the last state transition. Housekeeping relies on this being
    /// strictly increasing across transitions.
    pub modify_time: DateTime<Utc>,
}

impl Execution {
    pub fn new(job: &Job, node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            namespace: if job.namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                job.namespace.clone()
            },
            node_id: node_id.into(),
            compute_state: ComputeState::new(ExecutionStateType::New),
            desired_state: ExecutionDesiredState::Pending,
            revision: 1,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn state(&self) -> ExecutionStateType {
        self.compute_state.state_type
    }

    pub fn is_terminal(&self) -> bool {
        self.compute_state.state_type.is_terminal()
    }

    /// Move to `state`, bumping the revision and advancing `modify_time` to
    /// `now`, or one nanosecond past the previous value if the clock has not
    /// moved forward.
    pub fn transition(
        &mut self,
        state: ExecutionStateType,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.compute_state = ComputeState {
            state_type: state,
            message,
        };
        self.revision += 1;
        self.modify_time = if now > self.modify_time {
            now
        } else {
            self.modify_time + chrono::Duration::nanoseconds(1)
        };
    }
}
