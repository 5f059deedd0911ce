use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::jobstore::{InMemoryJobStore, JobStateStore, JobStore};
use crate::models::{Evaluation, Job};
use crate::orchestrator::{
    ExecutionCallbackHandler, Housekeeping, HousekeepingParams, InMemoryEvaluationBroker,
    JobSubmitter, NodeMonitor, Scheduler, WorkerPool,
};
use crate::routing::InMemoryNodeInfoStore;
use crate::transport::{DebugInfoProvider, TransportLayer};

/// Orchestrator node wiring every subsystem around one broker and store.
pub struct OrchestratorNode {
    pub config: NodeConfig,
    pub store: Arc<dyn JobStateStore>,
    pub broker: InMemoryEvaluationBroker,
    pub nodes: Arc<InMemoryNodeInfoStore>,
    pub housekeeping: Arc<Housekeeping>,
    pub node_monitor: NodeMonitor,
    pub workers: Arc<WorkerPool>,
    pub transport: Arc<dyn TransportLayer>,
    submitter: JobSubmitter,
    callback: Arc<ExecutionCallbackHandler>,
    background: TaskTracker,
}

impl OrchestratorNode {
    /// Build every subsystem on an in-memory job store.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn TransportLayer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryJobStore::new()), transport, scheduler)
    }

    /// Build every subsystem around `store`. Configuration errors surface
    /// here, before anything starts.
    pub fn with_store<S>(
        config: NodeConfig,
        store: Arc<S>,
        transport: Arc<dyn TransportLayer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self>
    where
        S: JobStateStore + 'static,
    {
        config.validate()?;

        let reader: Arc<dyn JobStore> = store.clone();
        let store: Arc<dyn JobStateStore> = store;
        let broker = InMemoryEvaluationBroker::with_store(config.broker.clone(), store.clone())?;
        let nodes = Arc::new(InMemoryNodeInfoStore::new());

        let housekeeping = Housekeeping::new(HousekeepingParams::new(
            Arc::new(broker.clone()),
            reader,
            &config.housekeeping,
        ))?;
        let node_monitor = NodeMonitor::new(
            nodes.clone(),
            store.clone(),
            Arc::new(broker.clone()),
            &config.node_info,
        )?;
        let workers = WorkerPool::new(Arc::new(broker.clone()), scheduler, &config.workers)?;

        Ok(Self {
            submitter: JobSubmitter::new(store.clone(), Arc::new(broker.clone())),
            callback: Arc::new(ExecutionCallbackHandler::new(
                store.clone(),
                Arc::new(broker.clone()),
            )),
            housekeeping: Arc::new(housekeeping),
            workers: Arc::new(workers),
            background: TaskTracker::new(),
            config,
            store,
            broker,
            nodes,
            node_monitor,
            transport,
        })
    }

    /// Persist a job with its registration evaluation and queue it.
    pub async fn submit_job(&self, job: Job) -> Result<Evaluation> {
        self.submitter.submit(job).await
    }

    pub fn debug_providers(&self) -> Vec<Arc<dyn DebugInfoProvider>> {
        let mut providers: Vec<Arc<dyn DebugInfoProvider>> = vec![
            Arc::new(self.broker.clone()),
            self.housekeeping.clone(),
            self.workers.clone(),
        ];
        providers.extend(self.transport.debug_info_providers());
        providers
    }

    pub fn dashboard_state(&self) -> DashboardState {
        DashboardState {
            node_id: self.config.node_id.clone(),
            broker: self.broker.clone(),
            store: self.store.clone(),
            nodes: self.nodes.clone(),
            submitter: self.submitter.clone(),
            debug_providers: self.debug_providers(),
        }
    }

    /// Register handlers with the transport and start every background loop
    /// under `root`.
    pub async fn start(&self, root: &CancellationToken) -> Result<()> {
        self.transport
            .register_compute_callback(self.callback.clone())
            .await?;
        self.transport
            .register_node_info_consumer(self.nodes.clone())
            .await?;

        self.workers.start(root);
        self.housekeeping.start(root);
        self.node_monitor.start(root);

        if let Some(addr) = self.config.dashboard_addr {
            let state = self.dashboard_state();
            let token = root.child_token();
            self.background.spawn(async move {
                run_dashboard(addr, state, token).await;
            });
        }

        let connection = self.transport.connection_info().await;
        tracing::info!(
            node_id = %self.config.node_id,
            substrate = %connection.substrate,
            address = %connection.address,
            workers = self.workers.len(),
            "Orchestrator started"
        );
        Ok(())
    }

    /// Ordered teardown, bounded by the configured shutdown timeout:
    /// evaluation producers first, then the broker, then the workers it
    /// feeds, then the transport.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let remaining = || Some(deadline.saturating_duration_since(Instant::now()));

        tracing::info!(node_id = %self.config.node_id, "Shutting down orchestrator");

        let (housekeeping, monitor) = tokio::join!(
            self.housekeeping.stop(remaining()),
            self.node_monitor.stop(remaining())
        );
        self.broker.close().await;
        let workers = self.workers.stop(remaining()).await;

        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "Transport close failed");
        }

        self.background.close();
        let background = tokio::time::timeout(
            remaining().unwrap_or(Duration::ZERO),
            self.background.wait(),
        )
        .await
        .is_ok();

        if housekeeping && monitor && workers && background {
            tracing::info!(node_id = %self.config.node_id, "Orchestrator stopped");
        } else {
            tracing::warn!(
                node_id = %self.config.node_id,
                housekeeping,
                monitor,
                workers,
                background,
                "Orchestrator stopped before every subsystem drained"
            );
        }
    }

    /// Start, wait for `shutdown`, then tear down.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.start(&shutdown).await?;
        shutdown.cancelled().await;
        self.shutdown().await;
        Ok(())
    }
}
