use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlotillaError;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Batch,
    Service,
    Ops,
    Daemon,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Batch,
        JobType::Service,
        JobType::Ops,
        JobType::Daemon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Batch => "batch",
            JobType::Service => "service",
            JobType::Ops => "ops",
            JobType::Daemon => "daemon",
        }
    }

    /// Service and daemon jobs never finish on their own, so they have no
    /// execution timeout to enforce.
    pub fn is_long_running(&self) -> bool {
        matches!(self, JobType::Service | JobType::Daemon)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FlotillaError::UnknownVariant {
                kind: "job type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Queued,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Stopped
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| FlotillaError::UnknownVariant {
                kind: "job state",
                value: s.to_string(),
            })
    }
}

/// Per-task timeouts, in whole seconds. Zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeouts {
    pub execution_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub engine: String,
    pub timeouts: TaskTimeouts,
}

impl Task {
    pub fn new(name: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
            timeouts: TaskTimeouts::default(),
        }
    }

    /// Set the execution timeout. Fractions of a second round up, so any
    /// non-zero timeout stays bounded.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.execution_timeout_secs =
            timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        match self.timeouts.execution_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub job_type: JobType,
    pub state: JobState,
    pub tasks: Vec<Task>,
    pub version: u64,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, job_type: JobType, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_type,
            state: JobState::Pending,
            tasks,
            version: 1,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn is_long_running(&self) -> bool {
        self.job_type.is_long_running()
    }

    /// The longest bounded execution timeout among the job's tasks.
    /// `None` when no task carries a timeout.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.tasks.iter().filter_map(Task::execution_timeout).max()
    }
}
