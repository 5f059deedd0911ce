use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{FlotillaError, Result};
use crate::models::Evaluation;
use crate::orchestrator::broker::{EvaluationBroker, LeasedEvaluation};
use crate::orchestrator::lifecycle::{Lifecycle, RunId};
use crate::transport::{DebugInfo, DebugInfoProvider};

/// Placement logic. An `Err` nacks the evaluation for redelivery.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn process(&self, evaluation: &Evaluation) -> Result<()>;
}

#[derive(Debug, Default)]
struct WorkerCounters {
    acked: AtomicU64,
    nacked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub acked: u64,
    pub nacked: u64,
}

/// Dequeues evaluations one at a time and hands them to the scheduler.
pub struct Worker {
    id: String,
    broker: Arc<dyn EvaluationBroker>,
    scheduler: Arc<dyn Scheduler>,
    dequeue_timeout: Duration,
    error_backoff: Duration,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        broker: Arc<dyn EvaluationBroker>,
        scheduler: Arc<dyn Scheduler>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            broker,
            scheduler,
            dequeue_timeout: config.dequeue_timeout,
            error_backoff: config.error_backoff,
            counters: Arc::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            acked: self.counters.acked.load(Ordering::Relaxed),
            nacked: self.counters.nacked.load(Ordering::Relaxed),
        }
    }

    /// Loop until `shutdown` is cancelled or the broker closes. An
    /// evaluation already leased is always acked or nacked before exiting.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::debug!(worker_id = %self.id, "Worker started");
        loop {
            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.broker.dequeue(&self.id, self.dequeue_timeout) => dequeued,
            };

            match dequeued {
                Ok(Some(leased)) => self.handle(leased).await,
                Ok(None) => {}
                Err(FlotillaError::BrokerClosed) => {
                    tracing::debug!(worker_id = %self.id, "Broker closed, worker exiting");
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }
        tracing::debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn handle(&self, leased: LeasedEvaluation) {
        let evaluation = &leased.evaluation;
        match self.scheduler.process(evaluation).await {
            Ok(()) => match self.broker.ack(&leased.token).await {
                Ok(()) => {
                    self.counters.acked.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!(
                    worker_id = %self.id,
                    eval_id = %evaluation.id,
                    error = %e,
                    "Failed to ack evaluation"
                ),
            },
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.id,
                    eval_id = %evaluation.id,
                    job_id = %evaluation.job_id,
                    delivery = leased.delivery,
                    transient = e.is_transient(),
                    error = %e,
                    "Scheduler failed to process evaluation"
                );
                match self.broker.nack(&leased.token).await {
                    Ok(()) => {
                        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => tracing::warn!(
                        worker_id = %self.id,
                        eval_id = %evaluation.id,
                        error = %e,
                        "Failed to nack evaluation"
                    ),
                }
            }
        }
    }
}

/// A fixed set of workers sharing one broker and one scheduler.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    lifecycle: Lifecycle,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn EvaluationBroker>,
        scheduler: Arc<dyn Scheduler>,
        config: &WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let workers = (0..config.count)
            .map(|i| {
                Arc::new(Worker::new(
                    format!("worker-{i}"),
                    broker.clone(),
                    scheduler.clone(),
                    config,
                ))
            })
            .collect();
        Ok(Self {
            workers,
            lifecycle: Lifecycle::new("worker_pool"),
        })
    }

    pub fn start(&self, parent: &CancellationToken) -> RunId {
        let workers = self.workers.clone();
        self.lifecycle.start(parent, move |token| async move {
            let handles: Vec<_> = workers
                .into_iter()
                .map(|worker| {
                    let token = token.clone();
                    tokio::spawn(async move { worker.run(token).await })
                })
                .collect();
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Worker task failed");
                }
            }
        })
    }

    pub async fn stop(&self, deadline: Option<Duration>) -> bool {
        self.lifecycle.stop(deadline).await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn stats(&self) -> WorkerStats {
        self.workers.iter().fold(WorkerStats::default(), |acc, w| {
            let s = w.stats();
            WorkerStats {
                acked: acc.acked + s.acked,
                nacked: acc.nacked + s.nacked,
            }
        })
    }
}

impl DebugInfoProvider for WorkerPool {
    fn debug_info(&self) -> DebugInfo {
        let workers: Vec<_> = self
            .workers
            .iter()
            .map(|w| serde_json::json!({ "id": w.id(), "stats": w.stats() }))
            .collect();
        DebugInfo::new(
            "worker_pool",
            serde_json::json!({
                "running": self.is_running(),
                "workers": workers,
            }),
        )
    }
}
