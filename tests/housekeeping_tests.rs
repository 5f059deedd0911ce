use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flotilla::config::BrokerConfig;
use flotilla::error::{FlotillaError, Result};
use flotilla::jobstore::{InMemoryJobStore, JobStateStore, JobStore};
use flotilla::models::{
    EvalTrigger, Evaluation, Execution, ExecutionStateType, Job, JobType, Task,
};
use flotilla::orchestrator::{
    EvaluationBroker, Housekeeping, HousekeepingParams, InMemoryEvaluationBroker, LeaseToken,
    LeasedEvaluation,
};

const TASK_TIMEOUT: Duration = Duration::from_secs(60);
const BUFFER: Duration = Duration::from_secs(60);

/// Job store returning canned jobs and executions.
#[derive(Default)]
struct ScriptedJobStore {
    /// Consumed one per listing; once empty, `jobs` is returned.
    rounds: Mutex<VecDeque<Vec<Job>>>,
    jobs: Vec<Job>,
    executions: HashMap<Uuid, Vec<Execution>>,
    created: Mutex<Vec<Evaluation>>,
    execution_lookups: Mutex<Vec<Uuid>>,
    fail_listing: AtomicBool,
    stall_listing: AtomicBool,
    stall_persist: AtomicBool,
}

impl ScriptedJobStore {
    fn with(jobs: Vec<(Job, Vec<Execution>)>) -> Self {
        let mut store = Self::default();
        for (job, executions) in jobs {
            store.executions.insert(job.id, executions);
            store.jobs.push(job);
        }
        store
    }

    fn created(&self) -> Vec<Evaluation> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for ScriptedJobStore {
    async fn get_in_progress_jobs(&self, job_type: Option<JobType>) -> Result<Vec<Job>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(FlotillaError::Store("connection refused".into()));
        }
        if self.stall_listing.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let jobs = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.jobs.clone());
        Ok(jobs
            .into_iter()
            .filter(|j| job_type.map_or(true, |t| j.job_type == t))
            .collect())
    }

    async fn get_executions(&self, job_id: &Uuid) -> Result<Vec<Execution>> {
        self.execution_lookups.lock().unwrap().push(*job_id);
        Ok(self.executions.get(job_id).cloned().unwrap_or_default())
    }

    async fn create_evaluation(&self, evaluation: &Evaluation) -> Result<()> {
        if self.stall_persist.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.created.lock().unwrap().push(evaluation.clone());
        Ok(())
    }
}

/// Broker that records enqueues and can fail the first few.
#[derive(Default)]
struct RecordingBroker {
    enqueued: Mutex<Vec<Evaluation>>,
    failures_left: AtomicUsize,
    stall: AtomicBool,
}

impl RecordingBroker {
    fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn enqueued(&self) -> Vec<Evaluation> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait]
impl EvaluationBroker for RecordingBroker {
    async fn enqueue(&self, evaluation: Evaluation) -> Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlotillaError::BrokerClosed);
        }
        self.enqueued.lock().unwrap().push(evaluation);
        Ok(())
    }

    async fn dequeue(&self, _worker_id: &str, _timeout: Duration) -> Result<Option<LeasedEvaluation>> {
        Ok(None)
    }

    async fn ack(&self, _token: &LeaseToken) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _token: &LeaseToken) -> Result<()> {
        Ok(())
    }
}

fn job(job_type: JobType) -> Job {
    Job::new(
        "job",
        job_type,
        vec![Task::new("main", "docker").with_execution_timeout(TASK_TIMEOUT)],
    )
}

fn execution(job: &Job, age_secs: i64, state: ExecutionStateType) -> Execution {
    let mut execution = Execution::new(job, "node-1");
    execution.compute_state.state_type = state;
    execution.modify_time = Utc::now() - chrono::Duration::seconds(age_secs);
    execution
}

fn housekeeping(broker: Arc<dyn EvaluationBroker>, store: Arc<dyn JobStore>, interval: Duration) -> Housekeeping {
    Housekeeping::new(HousekeepingParams {
        broker,
        job_store: store,
        interval,
        workers: 2,
        timeout_buffer: BUFFER,
    })
    .unwrap()
}

async fn sweep(jobs: Vec<(Job, Vec<Execution>)>) -> (Arc<ScriptedJobStore>, Arc<RecordingBroker>) {
    let store = Arc::new(ScriptedJobStore::with(jobs));
    let broker = Arc::new(RecordingBroker::default());
    housekeeping(broker.clone(), store.clone(), Duration::from_secs(60))
        .sweep_once()
        .await;
    (store, broker)
}

/// An execution idle past timeout + buffer raises an exec-timeout evaluation.
#[tokio::test]
async fn test_stale_execution_raises_evaluation() {
    let j = job(JobType::Batch);
    let e = execution(&j, 121, ExecutionStateType::BidAccepted);
    let (store, broker) = sweep(vec![(j.clone(), vec![e])]).await;

    let enqueued = broker.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].job_id, j.id);
    assert_eq!(enqueued[0].triggered_by, EvalTrigger::ExecTimeout);
    assert_eq!(enqueued[0].job_type, JobType::Batch);

    // Persisted before it was enqueued.
    assert_eq!(store.created()[0].id, enqueued[0].id);
}

/// Executions younger than timeout + buffer are left alone.
#[tokio::test]
async fn test_execution_within_buffer_not_flagged() {
    let j = job(JobType::Batch);
    let (_, broker) = sweep(vec![(
        j.clone(),
        vec![
            execution(&j, 30, ExecutionStateType::BidAccepted),
            execution(&j, 90, ExecutionStateType::BidAccepted),
            execution(&j, 119, ExecutionStateType::Completed),
        ],
    )])
    .await;
    assert!(broker.enqueued().is_empty());
}

/// Just short of the limit is not stale, just past it is.
#[tokio::test]
async fn test_timeout_boundary() {
    let young = job(JobType::Batch);
    let old = job(JobType::Batch);
    let (_, broker) = sweep(vec![
        (young.clone(), vec![execution(&young, 118, ExecutionStateType::BidAccepted)]),
        (old.clone(), vec![execution(&old, 122, ExecutionStateType::BidAccepted)]),
    ])
    .await;

    let enqueued = broker.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].job_id, old.id);
}

/// Several stale executions in one job still raise exactly one evaluation.
#[tokio::test]
async fn test_multiple_stale_executions_deduplicated() {
    let j = job(JobType::Batch);
    let executions = vec![
        execution(&j, 120 + 1, ExecutionStateType::BidAccepted),
        execution(&j, 200, ExecutionStateType::AskForBidAccepted),
        execution(&j, 500, ExecutionStateType::New),
    ];
    let (store, broker) = sweep(vec![(j.clone(), executions)]).await;

    assert_eq!(broker.enqueued().len(), 1);
    assert_eq!(store.created().len(), 1);
}

/// Ops jobs run to completion and are checked like batch jobs.
#[tokio::test]
async fn test_ops_job_flagged() {
    let j = job(JobType::Ops);
    let (_, broker) = sweep(vec![(j.clone(), vec![execution(&j, 300, ExecutionStateType::BidAccepted)])]).await;
    assert_eq!(broker.enqueued().len(), 1);
    assert_eq!(broker.enqueued()[0].job_type, JobType::Ops);
}

/// Terminal executions are never flagged, however old.
#[tokio::test]
async fn test_terminal_executions_ignored() {
    let j = job(JobType::Batch);
    let executions = [
        ExecutionStateType::Completed,
        ExecutionStateType::Failed,
        ExecutionStateType::Cancelled,
        ExecutionStateType::BidRejected,
    ]
    .into_iter()
    .map(|state| execution(&j, 86_400, state))
    .collect();
    let (_, broker) = sweep(vec![(j, executions)]).await;
    assert!(broker.enqueued().is_empty());
}

/// Service and daemon jobs are exempt and their executions are not even fetched.
#[tokio::test]
async fn test_long_running_jobs_exempt() {
    let service = job(JobType::Service);
    let daemon = job(JobType::Daemon);
    let (store, broker) = sweep(vec![
        (service.clone(), vec![execution(&service, 86_400, ExecutionStateType::BidAccepted)]),
        (daemon.clone(), vec![execution(&daemon, 86_400, ExecutionStateType::BidAccepted)]),
    ])
    .await;

    assert!(broker.enqueued().is_empty());
    assert!(store.execution_lookups.lock().unwrap().is_empty());
}

/// Jobs whose tasks carry no timeout are never flagged.
#[tokio::test]
async fn test_unbounded_task_timeout_not_flagged() {
    let j = Job::new("unbounded", JobType::Batch, vec![Task::new("main", "docker")]);
    let (_, broker) = sweep(vec![(j.clone(), vec![execution(&j, 86_400, ExecutionStateType::BidAccepted)])]).await;
    assert!(broker.enqueued().is_empty());
}

/// Only the stale jobs among many get evaluations.
#[tokio::test]
async fn test_multiple_jobs() {
    let stale_a = job(JobType::Batch);
    let fresh = job(JobType::Batch);
    let stale_b = job(JobType::Ops);
    let (_, broker) = sweep(vec![
        (stale_a.clone(), vec![execution(&stale_a, 150, ExecutionStateType::BidAccepted)]),
        (fresh.clone(), vec![execution(&fresh, 10, ExecutionStateType::BidAccepted)]),
        (stale_b.clone(), vec![execution(&stale_b, 150, ExecutionStateType::BidAccepted)]),
    ])
    .await;

    let mut job_ids: Vec<Uuid> = broker.enqueued().iter().map(|e| e.job_id).collect();
    job_ids.sort();
    let mut expected = vec![stale_a.id, stale_b.id];
    expected.sort();
    assert_eq!(job_ids, expected);
}

#[tokio::test]
async fn test_no_jobs() {
    let (store, broker) = sweep(vec![]).await;
    assert!(broker.enqueued().is_empty());
    assert!(store.created().is_empty());
}

/// A failed enqueue keeps the persisted evaluation and does not stop the sweep.
#[tokio::test]
async fn test_enqueue_failure_does_not_abort_sweep() {
    let a = job(JobType::Batch);
    let b = job(JobType::Batch);
    let store = Arc::new(ScriptedJobStore::with(vec![
        (a.clone(), vec![execution(&a, 150, ExecutionStateType::BidAccepted)]),
        (b.clone(), vec![execution(&b, 150, ExecutionStateType::BidAccepted)]),
    ]));
    let broker = Arc::new(RecordingBroker::failing(1));
    let hk = housekeeping(broker.clone(), store.clone(), Duration::from_secs(60));

    let report = hk.sweep_once().await;
    assert_eq!(report.stale_jobs, 2);
    assert_eq!(report.evaluations_enqueued, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(store.created().len(), 2);
    assert_eq!(broker.enqueued().len(), 1);
}

/// A store outage is logged and the next sweep works normally.
#[tokio::test]
async fn test_store_error_is_survived() {
    let j = job(JobType::Batch);
    let store = Arc::new(ScriptedJobStore::with(vec![(
        j.clone(),
        vec![execution(&j, 150, ExecutionStateType::BidAccepted)],
    )]));
    let broker = Arc::new(RecordingBroker::default());
    let hk = housekeeping(broker.clone(), store.clone(), Duration::from_secs(60));

    store.fail_listing.store(true, Ordering::SeqCst);
    let report = hk.sweep_once().await;
    assert_eq!(report.errors, 1);
    assert!(broker.enqueued().is_empty());

    store.fail_listing.store(false, Ordering::SeqCst);
    hk.sweep_once().await;
    assert_eq!(broker.enqueued().len(), 1);
    assert_eq!(hk.last_sweep().unwrap().evaluations_enqueued, 1);
}

/// Consecutive sweeps each returning one different job evaluate every job once.
#[tokio::test]
async fn test_multiple_rounds() {
    let jobs: Vec<Job> = (0..3).map(|_| job(JobType::Batch)).collect();
    let mut store = ScriptedJobStore::default();
    for j in &jobs {
        store
            .executions
            .insert(j.id, vec![execution(j, 150, ExecutionStateType::BidAccepted)]);
        store.rounds.lock().unwrap().push_back(vec![j.clone()]);
    }
    let store = Arc::new(store);
    let broker = Arc::new(RecordingBroker::default());
    let hk = housekeeping(broker.clone(), store.clone(), Duration::from_millis(20));

    let root = CancellationToken::new();
    hk.start(&root);
    for _ in 0..100 {
        if broker.enqueued().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hk.stop(Some(Duration::from_secs(1))).await);

    let mut seen: Vec<Uuid> = broker.enqueued().iter().map(|e| e.job_id).collect();
    seen.sort();
    let mut expected: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

/// Start twice, stop twice and stop-before-start through the public API.
#[tokio::test]
async fn test_start_stop_idempotent() {
    let hk = housekeeping(
        Arc::new(RecordingBroker::default()),
        Arc::new(ScriptedJobStore::default()),
        Duration::from_millis(10),
    );
    assert!(hk.stop(Some(Duration::from_millis(10))).await);

    let root = CancellationToken::new();
    let run = hk.start(&root);
    assert_eq!(hk.start(&root), run);
    assert_eq!(hk.run_id(), Some(run));

    assert!(hk.stop(Some(Duration::from_secs(1))).await);
    assert!(!hk.is_running());
    assert!(hk.stop(None).await);

    let restarted = hk.start(&root);
    assert_ne!(restarted, run);
    hk.stop(None).await;
}

/// Cancelling the root token moves housekeeping back to idle.
#[tokio::test]
async fn test_cancelled_parent_stops_housekeeping() {
    let j = job(JobType::Batch);
    let store = Arc::new(ScriptedJobStore::with(vec![(
        j.clone(),
        vec![execution(&j, 150, ExecutionStateType::BidAccepted)],
    )]));
    let broker = Arc::new(RecordingBroker::default());
    let hk = housekeeping(broker.clone(), store, Duration::from_millis(10));

    let root = CancellationToken::new();
    hk.start(&root);
    root.cancel();
    assert!(!hk.is_running());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_cancel = broker.enqueued().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.enqueued().len(), after_cancel);
}

/// Start a fast-ticking housekeeping run, let it reach the backend, then
/// stop without a deadline.
async fn stop_during_sweep(store: Arc<ScriptedJobStore>, broker: Arc<RecordingBroker>) {
    let hk = housekeeping(broker, store, Duration::from_millis(10));
    let root = CancellationToken::new();
    hk.start(&root);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), hk.stop(None))
        .await
        .expect("stop should not wait on a stalled sweep");
    assert!(stopped);
    assert!(!hk.is_running());
}

/// A job store that never answers the listing does not hold up stop.
#[tokio::test]
async fn test_stop_interrupts_stalled_listing() {
    let store = Arc::new(ScriptedJobStore::default());
    store.stall_listing.store(true, Ordering::SeqCst);
    stop_during_sweep(store, Arc::new(RecordingBroker::default())).await;
}

/// A job store that never finishes persisting does not hold up stop, and
/// nothing reaches the broker.
#[tokio::test]
async fn test_stop_interrupts_stalled_persist() {
    let j = job(JobType::Batch);
    let store = Arc::new(ScriptedJobStore::with(vec![(
        j.clone(),
        vec![execution(&j, 150, ExecutionStateType::BidAccepted)],
    )]));
    store.stall_persist.store(true, Ordering::SeqCst);
    let broker = Arc::new(RecordingBroker::default());

    stop_during_sweep(store.clone(), broker.clone()).await;
    assert!(store.created().is_empty());
    assert!(broker.enqueued().is_empty());
}

/// A broker that never accepts does not hold up stop; the evaluation is
/// already persisted.
#[tokio::test]
async fn test_stop_interrupts_stalled_enqueue() {
    let j = job(JobType::Batch);
    let store = Arc::new(ScriptedJobStore::with(vec![(
        j.clone(),
        vec![execution(&j, 150, ExecutionStateType::BidAccepted)],
    )]));
    let broker = Arc::new(RecordingBroker::default());
    broker.stall.store(true, Ordering::SeqCst);

    stop_during_sweep(store.clone(), broker.clone()).await;
    assert_eq!(store.created().len(), 1);
    assert_eq!(store.created()[0].job_id, j.id);
    assert!(broker.enqueued().is_empty());
}

/// A half-second task timeout is enforced rather than read as unbounded.
#[tokio::test]
async fn test_sub_second_task_timeout_is_enforced() {
    let j = Job::new(
        "quick",
        JobType::Batch,
        vec![Task::new("main", "docker").with_execution_timeout(Duration::from_millis(500))],
    );
    let e = execution(&j, 86_400, ExecutionStateType::BidAccepted);
    let (_, broker) = sweep(vec![(j.clone(), vec![e])]).await;

    let enqueued = broker.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].job_id, j.id);
}

/// J1 (batch, 60s task timeout) with an execution idle for 120s+ is
/// evaluated ahead of an unrelated evaluation enqueued afterwards.
#[tokio::test]
async fn test_j1_scenario_with_real_broker() {
    let store = Arc::new(InMemoryJobStore::new());
    let broker = InMemoryEvaluationBroker::new(BrokerConfig::default()).unwrap();

    let j1 = job(JobType::Batch);
    store.create_job(j1.clone()).await.unwrap();
    let mut e1 = Execution::new(&j1, "node-1");
    e1.compute_state.state_type = ExecutionStateType::BidAccepted;
    e1.modify_time = Utc::now() - chrono::Duration::seconds(121);
    store.create_execution(e1).await.unwrap();

    let hk = housekeeping(Arc::new(broker.clone()), store.clone(), Duration::from_secs(60));
    let report = hk.sweep_once().await;
    assert_eq!(report.evaluations_enqueued, 1);

    let other = job(JobType::Batch);
    store.create_job(other.clone()).await.unwrap();
    broker
        .enqueue(Evaluation::for_job(&other, EvalTrigger::JobRegister))
        .await
        .unwrap();

    let first = broker
        .dequeue("scheduler-1", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.evaluation.job_id, j1.id);
    assert_eq!(first.evaluation.triggered_by, EvalTrigger::ExecTimeout);

    let persisted = store.evaluations_for_job(&j1.id).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].id, first.evaluation.id);
}
