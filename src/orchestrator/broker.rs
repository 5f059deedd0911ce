//! In-memory evaluation broker.
//!
//! Every evaluation moves through the same stages:
//!
//! ```text
//! enqueue ─► waiting (job busy) ─► ready ─► leased ─► ack ─► done
//!                                    ▲        │
//!                                    │        ├─ nack / lease expiry ─► delayed ─┐
//!                                    └────────┼──────────────────────────────────┘
//!                                             └─ delivery limit reached ─► failed
//! ```
//!
//! A job is *owned* by exactly one evaluation from the moment that
//! evaluation becomes ready until it is acked or fails. While a job is
//! owned, newer evaluations for it wait behind the owner, and at most one
//! waits: a later raise replaces the waiting one (it is coalesced). This
//! gives strict per-job ordering with no two leases ever held for the same
//! job, while unrelated jobs are delivered FIFO and in parallel.
//!
//! When built with a job store the broker writes each evaluation's final
//! status back to it: `complete` on ack, `failed` once the delivery limit is
//! reached and `cancelled` when a newer raise supersedes a waiting one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{FlotillaError, Result};
use crate::jobstore::JobStateStore;
use crate::models::{EvalStatus, Evaluation};
use crate::transport::{DebugInfo, DebugInfoProvider};

/// Opaque handle proving ownership of a dequeued evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct LeasedEvaluation {
    pub evaluation: Evaluation,
    pub token: LeaseToken,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery: u32,
}

#[async_trait]
pub trait EvaluationBroker: Send + Sync {
    /// Admit an evaluation. Fails only for malformed input or a closed broker.
    async fn enqueue(&self, evaluation: Evaluation) -> Result<()>;

    /// Wait up to `timeout` for a ready evaluation. `Ok(None)` on timeout.
    async fn dequeue(&self, worker_id: &str, timeout: Duration)
        -> Result<Option<LeasedEvaluation>>;

    async fn ack(&self, token: &LeaseToken) -> Result<()>;

    async fn nack(&self, token: &LeaseToken) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub enabled: bool,
    pub ready: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub delayed: usize,
    pub failed: usize,
    pub coalesced: u64,
}

#[derive(Debug)]
struct Lease {
    evaluation: Evaluation,
    worker_id: String,
    deadline: Instant,
    /// Cancels this lease's expiry timer.
    timer: CancellationToken,
}

/// Final status to persist once the state lock is released.
#[derive(Debug)]
struct StatusUpdate {
    eval_id: Uuid,
    status: EvalStatus,
    comment: Option<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    enabled: bool,
    ready: VecDeque<Evaluation>,
    /// job id -> id of the evaluation currently owning the job
    owners: HashMap<Uuid, Uuid>,
    /// job id -> the single evaluation queued behind the owner
    waiting: HashMap<Uuid, Evaluation>,
    leases: HashMap<LeaseToken, Lease>,
    /// evaluation id -> evaluation sitting out its nack delay
    delayed: HashMap<Uuid, Evaluation>,
    /// evaluation id -> deliveries so far, for every tracked evaluation
    deliveries: HashMap<Uuid, u32>,
    failed: Vec<Evaluation>,
    coalesced: u64,
    status_updates: Vec<StatusUpdate>,
}

impl BrokerState {
    /// Returns true when the evaluation became ready.
    fn admit(&mut self, evaluation: Evaluation) -> bool {
        match self.owners.get(&evaluation.job_id) {
            Some(owner) if *owner != evaluation.id => {
                let job_id = evaluation.job_id;
                let replacement = evaluation.id;
                if let Some(superseded) = self.waiting.insert(job_id, evaluation) {
                    self.deliveries.remove(&superseded.id);
                    self.coalesced += 1;
                    self.status_updates.push(StatusUpdate {
                        eval_id: superseded.id,
                        status: EvalStatus::Cancelled,
                        comment: Some(format!("superseded by {replacement}")),
                    });
                    tracing::debug!(
                        job_id = %job_id,
                        superseded = %superseded.id,
                        "Coalesced waiting evaluation"
                    );
                }
                false
            }
            _ => {
                self.owners.insert(evaluation.job_id, evaluation.id);
                self.ready.push_back(evaluation);
                true
            }
        }
    }

    /// Drop the job's owner and promote whatever waited behind it.
    fn release_job(&mut self, job_id: &Uuid) -> bool {
        self.owners.remove(job_id);
        match self.waiting.remove(job_id) {
            Some(next) => self.admit(next),
            None => false,
        }
    }
}

struct BrokerInner {
    config: BrokerConfig,
    store: Option<Arc<dyn JobStateStore>>,
    state: Mutex<BrokerState>,
    notify: Notify,
    shutdown: CancellationToken,
    /// Lease expiry and redelivery timers.
    timers: TaskTracker,
}

/// In-memory [`EvaluationBroker`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryEvaluationBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for InMemoryEvaluationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEvaluationBroker")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl InMemoryEvaluationBroker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// A broker that records final evaluation statuses in `store`.
    pub fn with_store(config: BrokerConfig, store: Arc<dyn JobStateStore>) -> Result<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: BrokerConfig, store: Option<Arc<dyn JobStateStore>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BrokerInner {
                config,
                store,
                state: Mutex::new(BrokerState {
                    enabled: true,
                    ..Default::default()
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                timers: TaskTracker::new(),
            }),
        })
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.inner.state.lock().await;
        BrokerStats {
            enabled: state.enabled,
            ready: state.ready.len(),
            in_flight: state.leases.len(),
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            failed: state.failed.len(),
            coalesced: state.coalesced,
        }
    }

    /// Evaluations that exhausted their delivery limit.
    pub async fn failed_evaluations(&self) -> Vec<Evaluation> {
        self.inner.state.lock().await.failed.clone()
    }

    /// Push a lease's expiry out by a full visibility timeout.
    pub async fn extend_lease(&self, token: &LeaseToken) -> Result<()> {
        let deadline = Instant::now() + self.inner.config.visibility_timeout;
        let timer = {
            let mut state = self.inner.state.lock().await;
            let lease = state
                .leases
                .get_mut(token)
                .ok_or(FlotillaError::LeaseNotFound(token.0))?;
            lease.deadline = deadline;
            lease.timer.cancel();
            lease.timer = self.inner.shutdown.child_token();
            lease.timer.clone()
        };
        self.spawn_lease_timer(*token, deadline, timer);
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        !self.inner.state.lock().await.enabled
    }

    /// Disable the broker, drop all transient state and wake every blocked
    /// dequeuer with [`FlotillaError::BrokerClosed`].
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if !state.enabled {
                return;
            }
            let in_flight = state.leases.len();
            let failed = std::mem::take(&mut state.failed);
            let coalesced = state.coalesced;
            *state = BrokerState {
                enabled: false,
                failed,
                coalesced,
                ..Default::default()
            };
            tracing::info!(in_flight, "Evaluation broker closed");
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    async fn record_status(&self, updates: Vec<StatusUpdate>) {
        let Some(store) = &self.inner.store else {
            return;
        };
        for update in updates {
            if let Err(e) = store
                .update_evaluation_status(&update.eval_id, update.status, update.comment)
                .await
            {
                tracing::warn!(
                    eval_id = %update.eval_id,
                    status = %update.status,
                    error = %e,
                    "Failed to record evaluation status"
                );
            }
        }
    }

    fn spawn_lease_timer(&self, token: LeaseToken, deadline: Instant, timer: CancellationToken) {
        let broker = self.clone();
        self.inner.timers.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => broker.expire_lease(token).await,
            }
        });
    }

    async fn expire_lease(&self, token: LeaseToken) {
        let updates = {
            let mut state = self.inner.state.lock().await;
            let expired = state
                .leases
                .get(&token)
                .is_some_and(|lease| lease.deadline <= Instant::now());
            if !expired {
                return;
            }
            if let Some(lease) = state.leases.remove(&token) {
                tracing::warn!(
                    eval_id = %lease.evaluation.id,
                    job_id = %lease.evaluation.job_id,
                    worker_id = %lease.worker_id,
                    "Evaluation lease expired, treating as nack"
                );
                self.requeue(&mut state, lease.evaluation);
            }
            std::mem::take(&mut state.status_updates)
        };
        self.record_status(updates).await;
    }

    /// Shared nack path: fail the evaluation once its deliveries are used up,
    /// otherwise hold it for the backoff delay. The job stays owned either way
    /// until the evaluation is ready again or has failed.
    fn requeue(&self, state: &mut BrokerState, mut evaluation: Evaluation) {
        let deliveries = state.deliveries.get(&evaluation.id).copied().unwrap_or(0);

        if deliveries >= self.inner.config.delivery_limit {
            state.deliveries.remove(&evaluation.id);
            let job_id = evaluation.job_id;
            tracing::error!(
                eval_id = %evaluation.id,
                job_id = %job_id,
                deliveries,
                "Evaluation reached its delivery limit, marking failed"
            );
            evaluation.status = EvalStatus::Failed;
            evaluation.comment = Some(format!(
                "delivery limit of {} reached",
                self.inner.config.delivery_limit
            ));
            evaluation.modify_time = Utc::now();
            state.status_updates.push(StatusUpdate {
                eval_id: evaluation.id,
                status: EvalStatus::Failed,
                comment: evaluation.comment.clone(),
            });
            state.failed.push(evaluation);
            if state.release_job(&job_id) {
                self.inner.notify.notify_one();
            }
            return;
        }

        let delay = if deliveries <= 1 {
            self.inner.config.initial_nack_delay
        } else {
            self.inner.config.subsequent_nack_delay
        };

        if delay.is_zero() {
            if state.admit(evaluation) {
                self.inner.notify.notify_one();
            }
            return;
        }

        let eval_id = evaluation.id;
        tracing::debug!(eval_id = %eval_id, delay_ms = delay.as_millis(), "Delaying redelivery");
        state.delayed.insert(eval_id, evaluation);

        let broker = self.clone();
        self.inner.timers.spawn(async move {
            tokio::select! {
                _ = broker.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let mut state = broker.inner.state.lock().await;
                    if let Some(evaluation) = state.delayed.remove(&eval_id) {
                        if state.admit(evaluation) {
                            broker.inner.notify.notify_one();
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl EvaluationBroker for InMemoryEvaluationBroker {
    async fn enqueue(&self, evaluation: Evaluation) -> Result<()> {
        evaluation.validate()?;

        let mut state = self.inner.state.lock().await;
        if !state.enabled {
            return Err(FlotillaError::BrokerClosed);
        }
        if state.deliveries.contains_key(&evaluation.id) {
            tracing::debug!(eval_id = %evaluation.id, "Evaluation already tracked, ignoring");
            return Ok(());
        }

        tracing::debug!(
            eval_id = %evaluation.id,
            job_id = %evaluation.job_id,
            triggered_by = %evaluation.triggered_by,
            "Evaluation enqueued"
        );
        state.deliveries.insert(evaluation.id, 0);
        if state.admit(evaluation) {
            self.inner.notify.notify_one();
        }
        let updates = std::mem::take(&mut state.status_updates);
        drop(state);
        self.record_status(updates).await;
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<LeasedEvaluation>> {
        let wait_until = Instant::now() + timeout;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if !state.enabled {
                    return Err(FlotillaError::BrokerClosed);
                }

                if let Some(evaluation) = state.ready.pop_front() {
                    let token = LeaseToken::new();
                    let deadline = Instant::now() + self.inner.config.visibility_timeout;
                    let timer = self.inner.shutdown.child_token();
                    let delivery = {
                        let count = state.deliveries.entry(evaluation.id).or_insert(0);
                        *count += 1;
                        *count
                    };
                    state.leases.insert(
                        token,
                        Lease {
                            evaluation: evaluation.clone(),
                            worker_id: worker_id.to_string(),
                            deadline,
                            timer: timer.clone(),
                        },
                    );
                    drop(state);

                    self.spawn_lease_timer(token, deadline, timer);
                    tracing::debug!(
                        eval_id = %evaluation.id,
                        job_id = %evaluation.job_id,
                        worker_id,
                        delivery,
                        "Evaluation leased"
                    );
                    return Ok(Some(LeasedEvaluation {
                        evaluation,
                        token,
                        delivery,
                    }));
                }
            }

            if tokio::time::timeout_at(wait_until, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, token: &LeaseToken) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let lease = state
            .leases
            .remove(token)
            .ok_or(FlotillaError::LeaseNotFound(token.0))?;
        lease.timer.cancel();

        state.deliveries.remove(&lease.evaluation.id);
        tracing::debug!(
            eval_id = %lease.evaluation.id,
            job_id = %lease.evaluation.job_id,
            worker_id = %lease.worker_id,
            "Evaluation acked"
        );
        if state.release_job(&lease.evaluation.job_id) {
            self.inner.notify.notify_one();
        }
        state.status_updates.push(StatusUpdate {
            eval_id: lease.evaluation.id,
            status: EvalStatus::Complete,
            comment: None,
        });
        let updates = std::mem::take(&mut state.status_updates);
        drop(state);
        self.record_status(updates).await;
        Ok(())
    }

    async fn nack(&self, token: &LeaseToken) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let lease = state
            .leases
            .remove(token)
            .ok_or(FlotillaError::LeaseNotFound(token.0))?;
        lease.timer.cancel();

        tracing::debug!(
            eval_id = %lease.evaluation.id,
            job_id = %lease.evaluation.job_id,
            worker_id = %lease.worker_id,
            "Evaluation nacked"
        );
        self.requeue(&mut state, lease.evaluation);
        let updates = std::mem::take(&mut state.status_updates);
        drop(state);
        self.record_status(updates).await;
        Ok(())
    }
}

impl DebugInfoProvider for InMemoryEvaluationBroker {
    fn debug_info(&self) -> DebugInfo {
        let stats = match self.inner.state.try_lock() {
            Ok(state) => serde_json::json!({
                "enabled": state.enabled,
                "ready": state.ready.len(),
                "in_flight": state.leases.len(),
                "waiting": state.waiting.len(),
                "delayed": state.delayed.len(),
                "failed": state.failed.len(),
                "coalesced": state.coalesced,
                "timers": self.inner.timers.len(),
            }),
            Err(_) => serde_json::json!({ "busy": true }),
        };
        DebugInfo::new("evaluation_broker", stats)
    }
}
