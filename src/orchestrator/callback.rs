use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{FlotillaError, Result};
use crate::jobstore::{ExecutionUpdate, JobStateStore, JobStore};
use crate::models::{EvalTrigger, Evaluation, ExecutionDesiredState, ExecutionStateType};
use crate::orchestrator::broker::EvaluationBroker;
use crate::transport::{
    BidResult, CancelResult, ComputeCallback, ComputeFailure, RunResult, TransportError,
};

/// Applies compute-node reports to the job store and raises a follow-up
/// evaluation for every report that changed an execution.
pub struct ExecutionCallbackHandler {
    store: Arc<dyn JobStateStore>,
    broker: Arc<dyn EvaluationBroker>,
}

impl ExecutionCallbackHandler {
    pub fn new(store: Arc<dyn JobStateStore>, broker: Arc<dyn EvaluationBroker>) -> Self {
        Self { store, broker }
    }

    async fn apply(
        &self,
        job_id: Uuid,
        update: ExecutionUpdate,
        trigger: EvalTrigger,
    ) -> std::result::Result<(), TransportError> {
        let execution_id = update.execution_id;
        let current = self
            .store
            .get_execution(&execution_id)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))?;
        if current.job_id != job_id {
            return Err(TransportError::Remote(format!(
                "execution {execution_id} does not belong to job {job_id}"
            )));
        }

        match self
            .store
            .update_execution(update.expecting_revision(current.revision))
            .await
        {
            Ok(_) => {}
            // A late or duplicate report for an execution that already moved on.
            Err(FlotillaError::Conflict { reason, .. }) => {
                tracing::debug!(execution_id = %execution_id, reason = %reason, "Ignoring stale execution report");
                return Ok(());
            }
            Err(e) => return Err(TransportError::Remote(e.to_string())),
        }

        self.raise(job_id, trigger)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn raise(&self, job_id: Uuid, trigger: EvalTrigger) -> Result<()> {
        let job = self.store.get_job(&job_id).await?;
        let evaluation = Evaluation::for_job(&job, trigger);
        self.store.create_evaluation(&evaluation).await?;
        if let Err(e) = self.broker.enqueue(evaluation.clone()).await {
            tracing::warn!(
                job_id = %job_id,
                eval_id = %evaluation.id,
                error = %e,
                "Failed to enqueue persisted evaluation"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeCallback for ExecutionCallbackHandler {
    async fn on_bid_complete(&self, result: BidResult) -> std::result::Result<(), TransportError> {
        let state = match (result.accepted, result.wait_for_approval) {
            (true, true) => ExecutionStateType::AskForBidAccepted,
            (false, true) => ExecutionStateType::AskForBidRejected,
            (true, false) => ExecutionStateType::BidAccepted,
            (false, false) => ExecutionStateType::BidRejected,
        };
        tracing::debug!(
            execution_id = %result.execution_id,
            node_id = %result.routing.source_node_id,
            state = %state,
            "Bid result received"
        );

        let mut update = ExecutionUpdate::new(result.execution_id, state);
        if let Some(reason) = result.reason {
            update = update.with_message(reason);
        }
        if state == ExecutionStateType::BidAccepted {
            update = update.with_desired_state(ExecutionDesiredState::Running);
        }
        self.apply(result.job_id, update, EvalTrigger::ExecUpdate).await
    }

    async fn on_run_complete(&self, result: RunResult) -> std::result::Result<(), TransportError> {
        let message = match result.exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "completed".to_string(),
        };
        let update = ExecutionUpdate::new(result.execution_id, ExecutionStateType::Completed)
            .with_message(message)
            .with_desired_state(ExecutionDesiredState::Stopped);
        self.apply(result.job_id, update, EvalTrigger::ExecUpdate).await
    }

    async fn on_cancel_complete(
        &self,
        result: CancelResult,
    ) -> std::result::Result<(), TransportError> {
        let update = ExecutionUpdate::new(result.execution_id, ExecutionStateType::Cancelled)
            .with_desired_state(ExecutionDesiredState::Stopped);
        self.apply(result.job_id, update, EvalTrigger::ExecUpdate).await
    }

    async fn on_compute_failure(
        &self,
        failure: ComputeFailure,
    ) -> std::result::Result<(), TransportError> {
        tracing::warn!(
            execution_id = %failure.execution_id,
            node_id = %failure.routing.source_node_id,
            error = %failure.error,
            "Compute node reported failure"
        );
        let update = ExecutionUpdate::new(failure.execution_id, ExecutionStateType::Failed)
            .with_message(failure.error)
            .with_desired_state(ExecutionDesiredState::Stopped);
        self.apply(failure.job_id, update, EvalTrigger::ExecFailure).await
    }
}
