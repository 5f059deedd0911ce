//! Execution-timeout sweeper.
//!
//! Every `interval` the sweeper asks the job store for in-progress jobs,
//! skips long-running job types, fetches executions for the rest with up to
//! `workers` lookups in flight, and raises one `exec-timeout` evaluation per
//! job that has at least one non-terminal execution idle for longer than its
//! task timeout plus `timeout_buffer`.
//!
//! Each evaluation is persisted before it is enqueued. If the enqueue fails
//! the persisted record stays behind as the recovery path and the sweep
//! carries on with the next job. Every store and broker call in a sweep
//! races the run's cancellation token, so stopping never waits on a stalled
//! backend.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::HousekeepingConfig;
use crate::error::{FlotillaError, Result};
use crate::jobstore::JobStore;
use crate::models::{EvalTrigger, Evaluation, Execution, Job};
use crate::orchestrator::broker::EvaluationBroker;
use crate::orchestrator::lifecycle::{Lifecycle, RunId};
use crate::transport::{DebugInfo, DebugInfoProvider};

pub struct HousekeepingParams {
    pub broker: Arc<dyn EvaluationBroker>,
    pub job_store: Arc<dyn JobStore>,
    pub interval: Duration,
    pub workers: usize,
    pub timeout_buffer: Duration,
}

impl HousekeepingParams {
    pub fn new(
        broker: Arc<dyn EvaluationBroker>,
        job_store: Arc<dyn JobStore>,
        config: &HousekeepingConfig,
    ) -> Self {
        Self {
            broker,
            job_store,
            interval: config.interval,
            workers: config.workers,
            timeout_buffer: config.timeout_buffer,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub jobs_checked: usize,
    pub stale_jobs: usize,
    pub evaluations_enqueued: usize,
    pub errors: usize,
}

/// Whether `execution` has been idle past `timeout + buffer` as of `now`.
/// Terminal executions never expire. The boundary itself is not expired.
pub fn is_execution_expired(
    execution: &Execution,
    timeout: Duration,
    buffer: Duration,
    now: DateTime<Utc>,
) -> bool {
    if execution.is_terminal() {
        return false;
    }
    let Ok(limit) = chrono::Duration::from_std(timeout.saturating_add(buffer)) else {
        return false;
    };
    now.signed_duration_since(execution.modify_time) > limit
}

struct Sweeper {
    broker: Arc<dyn EvaluationBroker>,
    job_store: Arc<dyn JobStore>,
    workers: usize,
    timeout_buffer: Duration,
    last_sweep: Mutex<Option<SweepReport>>,
}

impl Sweeper {
    async fn stale_job(&self, job: Job, now: DateTime<Utc>) -> std::result::Result<Option<Job>, ()> {
        let Some(timeout) = job.execution_timeout() else {
            return Ok(None);
        };
        match self.job_store.get_executions(&job.id).await {
            Ok(executions) => {
                let stale = executions
                    .iter()
                    .any(|e| is_execution_expired(e, timeout, self.timeout_buffer, now));
                Ok(stale.then_some(job))
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to fetch executions");
                Err(())
            }
        }
    }

    async fn sweep(&self, token: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let listing = tokio::select! {
            _ = token.cancelled() => return report,
            listing = self.job_store.get_in_progress_jobs(None) => listing,
        };
        let jobs = match listing {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list in-progress jobs");
                report.errors += 1;
                return report;
            }
        };

        let candidates: Vec<Job> = jobs
            .into_iter()
            .filter(|job| !job.is_long_running())
            .collect();
        report.jobs_checked = candidates.len();

        let checks = stream::iter(candidates)
            .map(|job| self.stale_job(job, now))
            .buffer_unordered(self.workers)
            .collect::<Vec<_>>();
        let results = tokio::select! {
            _ = token.cancelled() => return report,
            results = checks => results,
        };

        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        for result in results {
            match result {
                Ok(Some(job)) if seen.insert(job.id) => stale.push(job),
                Ok(_) => {}
                Err(()) => report.errors += 1,
            }
        }
        stale.sort_by_key(|job| job.create_time);
        report.stale_jobs = stale.len();

        for job in stale {
            match self.raise(&job, token).await {
                Some(Ok(())) => report.evaluations_enqueued += 1,
                Some(Err(_)) => report.errors += 1,
                None => break,
            }
        }
        report
    }

    /// Persist then enqueue one timeout evaluation. Returns `None` when the
    /// token fires first; an evaluation that was already persisted stays in
    /// the store.
    async fn raise(&self, job: &Job, token: &CancellationToken) -> Option<Result<()>> {
        let evaluation = Evaluation::for_job(job, EvalTrigger::ExecTimeout)
            .with_comment("execution exceeded its timeout");

        let persisted = tokio::select! {
            _ = token.cancelled() => return None,
            persisted = self.job_store.create_evaluation(&evaluation) => persisted,
        };
        if let Err(e) = persisted {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist timeout evaluation");
            return Some(Err(e));
        }
        let enqueued = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(
                    job_id = %job.id,
                    eval_id = %evaluation.id,
                    "Shutdown interrupted enqueue of persisted timeout evaluation"
                );
                return None;
            }
            enqueued = self.broker.enqueue(evaluation.clone()) => enqueued,
        };
        if let Err(e) = enqueued {
            tracing::warn!(
                job_id = %job.id,
                eval_id = %evaluation.id,
                error = %e,
                "Failed to enqueue persisted timeout evaluation"
            );
            return Some(Err(e));
        }
        tracing::info!(job_id = %job.id, eval_id = %evaluation.id, "Raised execution timeout evaluation");
        Some(Ok(()))
    }

    async fn run(&self, interval: Duration, token: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(&token).await;
                    tracing::debug!(
                        jobs_checked = report.jobs_checked,
                        stale_jobs = report.stale_jobs,
                        enqueued = report.evaluations_enqueued,
                        errors = report.errors,
                        "Housekeeping sweep finished"
                    );
                    *self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
                }
            }
        }
    }
}

/// Background detector for executions that stopped making progress.
pub struct Housekeeping {
    sweeper: Arc<Sweeper>,
    interval: Duration,
    lifecycle: Lifecycle,
}

impl Housekeeping {
    pub fn new(params: HousekeepingParams) -> Result<Self> {
        if params.interval.is_zero() {
            return Err(FlotillaError::InvalidConfig(
                "housekeeping interval must be positive".to_string(),
            ));
        }
        if params.workers == 0 {
            return Err(FlotillaError::InvalidConfig(
                "housekeeping needs at least one worker".to_string(),
            ));
        }
        Ok(Self {
            sweeper: Arc::new(Sweeper {
                broker: params.broker,
                job_store: params.job_store,
                workers: params.workers,
                timeout_buffer: params.timeout_buffer,
                last_sweep: Mutex::new(None),
            }),
            interval: params.interval,
            lifecycle: Lifecycle::new("housekeeping"),
        })
    }

    /// Begin sweeping under a child of `parent`. Calling this while running
    /// returns the current run unchanged.
    pub fn start(&self, parent: &CancellationToken) -> RunId {
        let sweeper = self.sweeper.clone();
        let interval = self.interval;
        self.lifecycle
            .start(parent, move |token| async move { sweeper.run(interval, token).await })
    }

    /// Stop sweeping and wait for the current sweep, up to `deadline`.
    /// Returns false if the deadline cut the wait short.
    pub async fn stop(&self, deadline: Option<Duration>) -> bool {
        self.lifecycle.stop(deadline).await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.lifecycle.run_id()
    }

    /// Run a single sweep right now, outside the periodic loop.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = self.sweeper.sweep(&CancellationToken::new()).await;
        *self
            .sweeper
            .last_sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.sweeper
            .last_sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DebugInfoProvider for Housekeeping {
    fn debug_info(&self) -> DebugInfo {
        DebugInfo::new(
            "housekeeping",
            serde_json::json!({
                "running": self.is_running(),
                "run_id": self.run_id().map(|id| id.to_string()),
                "interval_ms": self.interval.as_millis() as u64,
                "workers": self.sweeper.workers,
                "timeout_buffer_ms": self.sweeper.timeout_buffer.as_millis() as u64,
                "last_sweep": self.last_sweep(),
            }),
        )
    }
}
