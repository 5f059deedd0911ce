use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeInfoConfig;
use crate::error::Result;
use crate::jobstore::{JobStateStore, JobStore};
use crate::models::{EvalTrigger, Evaluation};
use crate::orchestrator::broker::EvaluationBroker;
use crate::orchestrator::lifecycle::{Lifecycle, RunId};
use crate::routing::{InMemoryNodeInfoStore, NodeInfoStore};

struct Monitor {
    nodes: Arc<InMemoryNodeInfoStore>,
    store: Arc<dyn JobStateStore>,
    broker: Arc<dyn EvaluationBroker>,
    node_timeout: Duration,
}

impl Monitor {
    /// Raise one node-failure evaluation per job that still had work on a
    /// silent compute node, then drop the node. A node stays in the table
    /// until all of its evaluations are raised, so a failed raise is retried
    /// on the next check. Returns the node ids that were dropped.
    async fn check(&self, token: &CancellationToken) -> Vec<String> {
        let stale = self.nodes.stale_nodes(self.node_timeout, Utc::now()).await;
        let mut raised = HashSet::new();
        let mut lost = Vec::new();

        for node_id in stale {
            if token.is_cancelled() {
                break;
            }
            tracing::warn!(node_id = %node_id, timeout_secs = self.node_timeout.as_secs(), "Compute node lost");

            let jobs = match self.store.jobs_with_active_executions_on(&node_id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to list jobs on lost node");
                    continue;
                }
            };

            let mut complete = true;
            for job in jobs {
                if raised.contains(&job.id) {
                    continue;
                }
                let evaluation = Evaluation::for_job(&job, EvalTrigger::NodeFailure)
                    .with_comment(format!("node {node_id} stopped reporting"));
                match self.raise(evaluation).await {
                    Ok(()) => {
                        raised.insert(job.id);
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, node_id = %node_id, error = %e, "Failed to raise node failure evaluation");
                        complete = false;
                    }
                }
            }
            if !complete {
                continue;
            }

            if let Err(e) = self.nodes.delete(&node_id).await {
                tracing::warn!(node_id = %node_id, error = %e, "Failed to remove lost node");
                continue;
            }
            lost.push(node_id);
        }
        lost
    }

    async fn raise(&self, evaluation: Evaluation) -> Result<()> {
        self.store.create_evaluation(&evaluation).await?;
        if let Err(e) = self.broker.enqueue(evaluation.clone()).await {
            tracing::warn!(
                job_id = %evaluation.job_id,
                eval_id = %evaluation.id,
                error = %e,
                "Failed to enqueue persisted node failure evaluation"
            );
        }
        Ok(())
    }

    async fn run(&self, interval: Duration, token: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(&token).await;
                }
            }
        }
    }
}

/// Detects compute nodes that stopped publishing node info.
pub struct NodeMonitor {
    monitor: Arc<Monitor>,
    interval: Duration,
    lifecycle: Lifecycle,
}

impl NodeMonitor {
    pub fn new(
        nodes: Arc<InMemoryNodeInfoStore>,
        store: Arc<dyn JobStateStore>,
        broker: Arc<dyn EvaluationBroker>,
        config: &NodeInfoConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            monitor: Arc::new(Monitor {
                nodes,
                store,
                broker,
                node_timeout: config.node_timeout,
            }),
            interval: config.monitor_interval,
            lifecycle: Lifecycle::new("node_monitor"),
        })
    }

    pub fn start(&self, parent: &CancellationToken) -> RunId {
        let monitor = self.monitor.clone();
        let interval = self.interval;
        self.lifecycle
            .start(parent, move |token| async move { monitor.run(interval, token).await })
    }

    pub async fn stop(&self, deadline: Option<Duration>) -> bool {
        self.lifecycle.stop(deadline).await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// One check outside the periodic loop. Returns the lost node ids.
    pub async fn check_once(&self) -> Vec<String> {
        self.monitor.check(&CancellationToken::new()).await
    }
}
