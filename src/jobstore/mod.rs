//! Job store contract.
//!
//! The store is the single source of truth for jobs, executions and
//! evaluations. Housekeeping only ever reads from it or asks it to persist
//! new evaluations, through [`JobStore`]. Submission, compute callbacks,
//! node-failure detection and the broker's status write-back go through
//! [`JobStateStore`]. The concrete persistence engine lives behind these
//! traits; [`InMemoryJobStore`] is the in-process implementation used by
//! the launcher and the tests.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    EvalStatus, Evaluation, Execution, ExecutionDesiredState, ExecutionStateType, Job, JobState,
    JobType,
};

pub use memory::InMemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Non-terminal jobs, optionally restricted to one job type.
    async fn get_in_progress_jobs(&self, job_type: Option<JobType>) -> Result<Vec<Job>>;

    /// All executions recorded for a job, in creation order.
    async fn get_executions(&self, job_id: &Uuid) -> Result<Vec<Execution>>;

    async fn create_evaluation(&self, evaluation: &Evaluation) -> Result<()>;
}

/// Write path and lookups on top of [`JobStore`].
#[async_trait]
pub trait JobStateStore: JobStore {
    async fn create_job(&self, job: Job) -> Result<()>;

    async fn get_job(&self, id: &Uuid) -> Result<Job>;

    /// Move a job to `new_state`. Terminal jobs cannot change state again.
    async fn update_job_state(&self, id: &Uuid, new_state: JobState) -> Result<Job>;

    async fn create_execution(&self, execution: Execution) -> Result<()>;

    async fn get_execution(&self, id: &Uuid) -> Result<Execution>;

    /// Apply a conditional transition, see [`ExecutionUpdate`].
    async fn update_execution(&self, update: ExecutionUpdate) -> Result<Execution>;

    async fn get_evaluation(&self, id: &Uuid) -> Result<Evaluation>;

    async fn update_evaluation_status(
        &self,
        id: &Uuid,
        status: EvalStatus,
        comment: Option<String>,
    ) -> Result<Evaluation>;

    /// Evaluations raised for a job, oldest first.
    async fn evaluations_for_job(&self, job_id: &Uuid) -> Result<Vec<Evaluation>>;

    /// In-progress jobs with at least one non-terminal execution on `node_id`.
    async fn jobs_with_active_executions_on(&self, node_id: &str) -> Result<Vec<Job>>;
}

/// A conditional state transition for one execution.
///
/// The update is rejected with [`FlotillaError::Conflict`] when any of the
/// expectations no longer hold, or when the execution already reached a
/// terminal state.
///
/// [`FlotillaError::Conflict`]: crate::error::FlotillaError::Conflict
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub execution_id: Uuid,
    pub new_state: ExecutionStateType,
    pub message: Option<String>,
    pub desired_state: Option<ExecutionDesiredState>,
    pub expected_state: Option<ExecutionStateType>,
    pub expected_revision: Option<u64>,
}

impl ExecutionUpdate {
    pub fn new(execution_id: Uuid, new_state: ExecutionStateType) -> Self {
        Self {
            execution_id,
            new_state,
            message: None,
            desired_state: None,
            expected_state: None,
            expected_revision: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_desired_state(mut self, desired: ExecutionDesiredState) -> Self {
        self.desired_state = Some(desired);
        self
    }

    pub fn expecting_state(mut self, state: ExecutionStateType) -> Self {
        self.expected_state = Some(state);
        self
    }

    pub fn expecting_revision(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}
