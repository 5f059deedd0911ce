use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use flotilla::config::BrokerConfig;
use flotilla::jobstore::{InMemoryJobStore, JobStateStore, JobStore};
use flotilla::models::{EvalStatus, EvalTrigger, Evaluation, Job, JobType};
use flotilla::orchestrator::{EvaluationBroker, InMemoryEvaluationBroker};

fn broker() -> InMemoryEvaluationBroker {
    InMemoryEvaluationBroker::new(BrokerConfig {
        initial_nack_delay: Duration::ZERO,
        subsequent_nack_delay: Duration::ZERO,
        ..Default::default()
    })
    .unwrap()
}

fn job() -> Job {
    Job::new("job", JobType::Batch, vec![])
}

/// Concurrent enqueues for one job never produce two simultaneous leases.
#[tokio::test]
async fn test_per_job_exclusivity_under_concurrency() {
    let broker = broker();
    let job = job();

    let enqueues: Vec<_> = (0..16)
        .map(|_| {
            let broker = broker.clone();
            let eval = Evaluation::for_job(&job, EvalTrigger::ExecUpdate);
            tokio::spawn(async move { broker.enqueue(eval).await })
        })
        .collect();
    for handle in enqueues {
        handle.await.unwrap().unwrap();
    }

    let holders = Arc::new(Mutex::new(HashSet::<Uuid>::new()));
    let max_concurrent = Arc::new(Mutex::new(0usize));
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let broker = broker.clone();
            let holders = holders.clone();
            let max_concurrent = max_concurrent.clone();
            tokio::spawn(async move {
                let worker_id = format!("worker-{i}");
                let mut processed = 0;
                while let Some(leased) = broker
                    .dequeue(&worker_id, Duration::from_millis(100))
                    .await
                    .unwrap()
                {
                    {
                        let mut held = holders.lock().await;
                        held.insert(leased.evaluation.id);
                        let mut max = max_concurrent.lock().await;
                        *max = (*max).max(held.len());
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    holders.lock().await.remove(&leased.evaluation.id);
                    broker.ack(&leased.token).await.unwrap();
                    processed += 1;
                }
                processed
            })
        })
        .collect();

    let mut total = 0;
    for worker in workers {
        total += worker.await.unwrap();
    }

    assert_eq!(*max_concurrent.lock().await, 1);
    // The owner plus at most one coalesced waiter ever reach a worker.
    assert!((1..=2).contains(&total), "processed {total}");
    let stats = broker.stats().await;
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.waiting, 0);
    assert_eq!(total as u64 + stats.coalesced, 16);
}

/// Distinct jobs are leased in parallel.
#[tokio::test]
async fn test_distinct_jobs_lease_in_parallel() {
    let broker = broker();
    for _ in 0..3 {
        broker
            .enqueue(Evaluation::for_job(&job(), EvalTrigger::JobRegister))
            .await
            .unwrap();
    }

    let mut leases = Vec::new();
    for i in 0..3 {
        leases.push(
            broker
                .dequeue(&format!("w{i}"), Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(broker.stats().await.in_flight, 3);
    for lease in leases {
        broker.ack(&lease.token).await.unwrap();
    }
}

/// Evaluations for different jobs come out in enqueue order, and a job's
/// later evaluation never overtakes its earlier one.
#[tokio::test]
async fn test_fifo_with_per_job_ordering() {
    let broker = broker();
    let a = job();
    let b = job();
    let a1 = Evaluation::for_job(&a, EvalTrigger::JobRegister);
    let b1 = Evaluation::for_job(&b, EvalTrigger::JobRegister);
    let a2 = Evaluation::for_job(&a, EvalTrigger::ExecTimeout);
    for eval in [&a1, &b1, &a2] {
        broker.enqueue(eval.clone()).await.unwrap();
    }

    let first = broker.dequeue("w", Duration::from_millis(50)).await.unwrap().unwrap();
    let second = broker.dequeue("w", Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(first.evaluation.id, a1.id);
    assert_eq!(second.evaluation.id, b1.id);
    assert!(broker.dequeue("w", Duration::from_millis(20)).await.unwrap().is_none());

    broker.ack(&first.token).await.unwrap();
    let third = broker.dequeue("w", Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(third.evaluation.id, a2.id);
}

/// A worker that never acks loses the lease; after the delivery limit the
/// evaluation is surfaced as failed instead of retried forever.
#[tokio::test]
async fn test_abandoned_evaluation_ends_in_failed_list() {
    let broker = InMemoryEvaluationBroker::new(BrokerConfig {
        visibility_timeout: Duration::from_millis(30),
        delivery_limit: 2,
        initial_nack_delay: Duration::ZERO,
        subsequent_nack_delay: Duration::ZERO,
    })
    .unwrap();
    let eval = Evaluation::for_job(&job(), EvalTrigger::JobRegister);
    broker.enqueue(eval.clone()).await.unwrap();

    for delivery in 1..=2 {
        let leased = broker
            .dequeue("crashy", Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.delivery, delivery);
    }

    for _ in 0..50 {
        if broker.stats().await.failed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let failed = broker.failed_evaluations().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, eval.id);
    assert_eq!(failed[0].status, EvalStatus::Failed);
    assert!(broker.dequeue("w", Duration::from_millis(20)).await.unwrap().is_none());
}

/// Closing drops transient state but keeps the failed list for operators.
#[tokio::test]
async fn test_close_keeps_failed_evaluations() {
    let broker = InMemoryEvaluationBroker::new(BrokerConfig {
        delivery_limit: 1,
        initial_nack_delay: Duration::ZERO,
        subsequent_nack_delay: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();
    broker
        .enqueue(Evaluation::for_job(&job(), EvalTrigger::JobRegister))
        .await
        .unwrap();
    let leased = broker.dequeue("w", Duration::from_millis(50)).await.unwrap().unwrap();
    broker.nack(&leased.token).await.unwrap();
    broker
        .enqueue(Evaluation::for_job(&job(), EvalTrigger::JobRegister))
        .await
        .unwrap();

    broker.close().await;
    broker.close().await;

    let stats = broker.stats().await;
    assert!(!stats.enabled);
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.failed, 1);
}

async fn persisted(store: &InMemoryJobStore, job: &Job, trigger: EvalTrigger) -> Evaluation {
    let eval = Evaluation::for_job(job, trigger);
    store.create_evaluation(&eval).await.unwrap();
    eval
}

/// Final statuses land in the job store, not only in the broker.
#[tokio::test]
async fn test_final_status_is_written_to_store() {
    let store = Arc::new(InMemoryJobStore::new());
    let broker = InMemoryEvaluationBroker::with_store(
        BrokerConfig {
            delivery_limit: 1,
            initial_nack_delay: Duration::ZERO,
            subsequent_nack_delay: Duration::ZERO,
            ..Default::default()
        },
        store.clone(),
    )
    .unwrap();

    let done = job();
    let doomed = job();
    store.create_job(done.clone()).await.unwrap();
    store.create_job(doomed.clone()).await.unwrap();
    let ok = persisted(&store, &done, EvalTrigger::JobRegister).await;
    let bad = persisted(&store, &doomed, EvalTrigger::JobRegister).await;
    broker.enqueue(ok.clone()).await.unwrap();
    broker.enqueue(bad.clone()).await.unwrap();

    let first = broker.dequeue("w", Duration::from_millis(50)).await.unwrap().unwrap();
    let second = broker.dequeue("w", Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(first.evaluation.id, ok.id);
    broker.ack(&first.token).await.unwrap();
    broker.nack(&second.token).await.unwrap();

    assert_eq!(store.get_evaluation(&ok.id).await.unwrap().status, EvalStatus::Complete);
    let failed = store.get_evaluation(&bad.id).await.unwrap();
    assert_eq!(failed.status, EvalStatus::Failed);
    assert!(failed.comment.unwrap().contains("delivery limit"));
}

/// A waiting evaluation replaced by a newer raise is recorded as cancelled.
#[tokio::test]
async fn test_superseded_evaluation_is_cancelled_in_store() {
    let store = Arc::new(InMemoryJobStore::new());
    let broker = InMemoryEvaluationBroker::with_store(BrokerConfig::default(), store.clone()).unwrap();
    let job = job();
    store.create_job(job.clone()).await.unwrap();

    let owner = persisted(&store, &job, EvalTrigger::JobRegister).await;
    let older = persisted(&store, &job, EvalTrigger::ExecUpdate).await;
    let newer = persisted(&store, &job, EvalTrigger::ExecTimeout).await;
    for eval in [&owner, &older, &newer] {
        broker.enqueue(eval.clone()).await.unwrap();
    }

    let superseded = store.get_evaluation(&older.id).await.unwrap();
    assert_eq!(superseded.status, EvalStatus::Cancelled);
    assert_eq!(store.get_evaluation(&newer.id).await.unwrap().status, EvalStatus::Pending);
    assert_eq!(store.get_evaluation(&owner.id).await.unwrap().status, EvalStatus::Pending);
}
