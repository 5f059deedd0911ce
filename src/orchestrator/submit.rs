use std::sync::Arc;

use crate::error::{FlotillaError, Result};
use crate::jobstore::{JobStateStore, JobStore};
use crate::models::{EvalTrigger, Evaluation, Job};
use crate::orchestrator::broker::EvaluationBroker;

/// Entry point for new jobs: persist the job and its registration
/// evaluation, then queue the evaluation.
#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<dyn JobStateStore>,
    broker: Arc<dyn EvaluationBroker>,
}

impl JobSubmitter {
    pub fn new(store: Arc<dyn JobStateStore>, broker: Arc<dyn EvaluationBroker>) -> Self {
        Self { store, broker }
    }

    pub async fn submit(&self, job: Job) -> Result<Evaluation> {
        if job.tasks.is_empty() {
            return Err(FlotillaError::InvalidJob(format!(
                "job {} has no tasks",
                job.id
            )));
        }

        let evaluation = Evaluation::for_job(&job, EvalTrigger::JobRegister);
        tracing::info!(job_id = %job.id, job_type = %job.job_type, name = %job.name, "Job submitted");
        self.store.create_job(job).await?;
        self.store.create_evaluation(&evaluation).await?;
        self.broker.enqueue(evaluation.clone()).await?;
        Ok(evaluation)
    }
}
