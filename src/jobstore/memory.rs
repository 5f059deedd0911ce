use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{FlotillaError, Result};
use crate::jobstore::{ExecutionUpdate, JobStateStore, JobStore};
use crate::models::{EvalStatus, Evaluation, Execution, Job, JobState, JobType};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<Uuid, Job>,
    executions: HashMap<Uuid, Execution>,
    job_executions: HashMap<Uuid, Vec<Uuid>>,
    evaluations: HashMap<Uuid, Evaluation>,
}

/// Job store held entirely in memory.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: RwLock<StoreState>,
    max_jobs: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            max_jobs,
        }
    }
}

#[async_trait]
impl JobStateStore for InMemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(FlotillaError::JobExists(job.id));
        }
        if state.jobs.len() >= self.max_jobs {
            return Err(FlotillaError::Store(format!(
                "job store at capacity ({} jobs)",
                self.max_jobs
            )));
        }
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job created");
        state.job_executions.entry(job.id).or_default();
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Job> {
        self.state
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or(FlotillaError::JobNotFound(*id))
    }

    async fn update_job_state(&self, id: &Uuid, new_state: JobState) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or(FlotillaError::JobNotFound(*id))?;

        if job.state == new_state {
            return Ok(job.clone());
        }
        if job.state.is_terminal() {
            return Err(FlotillaError::Conflict {
                id: *id,
                reason: format!("job is already {}", job.state),
            });
        }

        job.state = new_state;
        job.version += 1;
        job.modify_time = Utc::now().max(job.modify_time);
        tracing::debug!(job_id = %id, state = %new_state, "Job state updated");
        Ok(job.clone())
    }

    async fn create_execution(&self, execution: Execution) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&execution.job_id) {
            return Err(FlotillaError::JobNotFound(execution.job_id));
        }
        if state.executions.contains_key(&execution.id) {
            return Err(FlotillaError::ExecutionExists(execution.id));
        }
        state
            .job_executions
            .entry(execution.job_id)
            .or_default()
            .push(execution.id);
        state.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Execution> {
        self.state
            .read()
            .await
            .executions
            .get(id)
            .cloned()
            .ok_or(FlotillaError::ExecutionNotFound(*id))
    }

    async fn update_execution(&self, update: ExecutionUpdate) -> Result<Execution> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .get_mut(&update.execution_id)
            .ok_or(FlotillaError::ExecutionNotFound(update.execution_id))?;

        let current = execution.state();
        if let Some(expected) = update.expected_state {
            if expected != current {
                return Err(FlotillaError::Conflict {
                    id: execution.id,
                    reason: format!("expected state {expected}, found {current}"),
                });
            }
        }
        if let Some(expected) = update.expected_revision {
            if expected != execution.revision {
                return Err(FlotillaError::Conflict {
                    id: execution.id,
                    reason: format!(
                        "expected revision {expected}, found {}",
                        execution.revision
                    ),
                });
            }
        }
        if current.is_terminal() {
            return Err(FlotillaError::Conflict {
                id: execution.id,
                reason: format!("execution is already {current}"),
            });
        }

        execution.transition(update.new_state, update.message, Utc::now());
        if let Some(desired) = update.desired_state {
            execution.desired_state = desired;
        }
        tracing::debug!(
            execution_id = %execution.id,
            job_id = %execution.job_id,
            from = %current,
            to = %update.new_state,
            "Execution state updated"
        );
        Ok(execution.clone())
    }

    async fn get_evaluation(&self, id: &Uuid) -> Result<Evaluation> {
        self.state
            .read()
            .await
            .evaluations
            .get(id)
            .cloned()
            .ok_or(FlotillaError::EvaluationNotFound(*id))
    }

    async fn update_evaluation_status(
        &self,
        id: &Uuid,
        status: EvalStatus,
        comment: Option<String>,
    ) -> Result<Evaluation> {
        let mut state = self.state.write().await;
        let evaluation = state
            .evaluations
            .get_mut(id)
            .ok_or(FlotillaError::EvaluationNotFound(*id))?;
        evaluation.status = status;
        if comment.is_some() {
            evaluation.comment = comment;
        }
        evaluation.modify_time = Utc::now().max(evaluation.modify_time);
        Ok(evaluation.clone())
    }

    async fn evaluations_for_job(&self, job_id: &Uuid) -> Result<Vec<Evaluation>> {
        let state = self.state.read().await;
        let mut evaluations: Vec<Evaluation> = state
            .evaluations
            .values()
            .filter(|e| e.job_id == *job_id)
            .cloned()
            .collect();
        evaluations.sort_by_key(|e| e.create_time);
        Ok(evaluations)
    }

    async fn jobs_with_active_executions_on(&self, node_id: &str) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .filter(|job| {
                state
                    .job_executions
                    .get(&job.id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| state.executions.get(id))
                    .any(|e| e.node_id == node_id && !e.is_terminal())
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.create_time);
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_in_progress_jobs(&self, job_type: Option<JobType>) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .filter(|job| job_type.map_or(true, |t| job.job_type == t))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.create_time);
        Ok(jobs)
    }

    async fn get_executions(&self, job_id: &Uuid) -> Result<Vec<Execution>> {
        let state = self.state.read().await;
        Ok(state
            .job_executions
            .get(job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.executions.get(id))
            .cloned()
            .collect())
    }

    async fn create_evaluation(&self, evaluation: &Evaluation) -> Result<()> {
        evaluation.validate()?;
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&evaluation.job_id) {
            return Err(FlotillaError::JobNotFound(evaluation.job_id));
        }
        if state.evaluations.contains_key(&evaluation.id) {
            return Err(FlotillaError::Conflict {
                id: evaluation.id,
                reason: "evaluation already exists".to_string(),
            });
        }
        state.evaluations.insert(evaluation.id, evaluation.clone());
        Ok(())
    }
}
