use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use flotilla::config::{BrokerConfig, HousekeepingConfig, NodeConfig, WorkerConfig};
use flotilla::error::Result;
use flotilla::models::{ComputeNodeInfo, Evaluation, NodeInfo};
use flotilla::node::OrchestratorNode;
use flotilla::orchestrator::Scheduler;
use flotilla::shutdown::install_shutdown_handler;
use flotilla::transport::{
    AskForBidRequest, ComputeEndpoint, ExecutionAck, ExecutionCommand, InProcNetwork,
    InProcTransport, NodeInfoPublisher, TransportError, TransportLayer,
};

#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(version)]
#[command(about = "Evaluation-driven job orchestrator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an orchestrator on the in-process transport
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Orchestrator node id
    #[arg(long, default_value = "orchestrator-1")]
    node_id: String,

    /// Port for the operator API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Scheduling workers dequeuing from the broker
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Seconds between housekeeping sweeps
    #[arg(long, default_value = "30")]
    housekeeping_interval: u64,

    /// Seconds of grace added to every task's execution timeout
    #[arg(long, default_value = "60")]
    timeout_buffer: u64,

    /// Seconds a dequeued evaluation stays leased
    #[arg(long, default_value = "60")]
    visibility_timeout: u64,

    /// Deliveries before an evaluation is marked failed
    #[arg(long, default_value = "3")]
    delivery_limit: u32,

    /// Local compute nodes to attach to the in-process network
    #[arg(long, default_value = "0")]
    compute_nodes: usize,
}

/// Stand-in placement that only records what it was asked to evaluate.
struct LoggingScheduler;

#[async_trait]
impl Scheduler for LoggingScheduler {
    async fn process(&self, evaluation: &Evaluation) -> Result<()> {
        tracing::info!(
            eval_id = %evaluation.id,
            job_id = %evaluation.job_id,
            job_type = %evaluation.job_type,
            triggered_by = %evaluation.triggered_by,
            "Evaluation processed"
        );
        Ok(())
    }
}

/// Compute endpoint that acknowledges every request without running work.
struct AckingEndpoint {
    node_id: String,
}

#[async_trait]
impl ComputeEndpoint for AckingEndpoint {
    async fn ask_for_bid(
        &self,
        request: AskForBidRequest,
    ) -> std::result::Result<ExecutionAck, TransportError> {
        tracing::info!(node_id = %self.node_id, execution_id = %request.execution.id, "Bid requested");
        Ok(ExecutionAck {
            execution_id: request.execution.id,
        })
    }

    async fn bid_accepted(
        &self,
        request: ExecutionCommand,
    ) -> std::result::Result<ExecutionAck, TransportError> {
        Ok(ExecutionAck {
            execution_id: request.execution_id,
        })
    }

    async fn bid_rejected(
        &self,
        request: ExecutionCommand,
    ) -> std::result::Result<ExecutionAck, TransportError> {
        Ok(ExecutionAck {
            execution_id: request.execution_id,
        })
    }

    async fn cancel_execution(
        &self,
        request: ExecutionCommand,
    ) -> std::result::Result<ExecutionAck, TransportError> {
        Ok(ExecutionAck {
            execution_id: request.execution_id,
        })
    }
}

async fn attach_compute_node(
    network: Arc<InProcNetwork>,
    config: &NodeConfig,
    index: usize,
    shutdown: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let node_id = format!("compute-{index}");
    let transport = Arc::new(InProcTransport::new(
        network,
        node_id.clone(),
        config.transport.clone(),
    )?);
    transport
        .register_compute_endpoint(Arc::new(AckingEndpoint {
            node_id: node_id.clone(),
        }))
        .await?;

    let publisher = NodeInfoPublisher::new(
        Arc::new(NodeInfo::compute(
            node_id,
            ComputeNodeInfo {
                execution_engines: vec!["noop".to_string()],
                ..Default::default()
            },
        )),
        transport.node_info_pubsub(),
        transport.node_info_decorator(),
        &config.node_info,
    );
    tokio::spawn(async move {
        publisher.run(shutdown).await;
        if let Err(e) = transport.close().await {
            tracing::warn!(error = %e, "Compute transport close failed");
        }
    });
    Ok(())
}

async fn run_serve(args: ServeArgs) -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = NodeConfig::new(args.node_id)
        .with_workers(WorkerConfig {
            count: args.workers,
            ..WorkerConfig::default()
        })
        .with_housekeeping(HousekeepingConfig {
            interval: Duration::from_secs(args.housekeeping_interval),
            timeout_buffer: Duration::from_secs(args.timeout_buffer),
            ..HousekeepingConfig::default()
        })
        .with_broker(BrokerConfig {
            visibility_timeout: Duration::from_secs(args.visibility_timeout),
            delivery_limit: args.delivery_limit,
            ..BrokerConfig::default()
        });
    if let Some(addr) = dashboard_addr {
        config = config.with_dashboard(addr);
    }

    let shutdown = install_shutdown_handler();
    let network = InProcNetwork::new(&config.transport);
    let transport = Arc::new(InProcTransport::new(
        network.clone(),
        config.node_id.clone(),
        config.transport.clone(),
    )?);

    for index in 0..args.compute_nodes {
        attach_compute_node(network.clone(), &config, index, shutdown.child_token()).await?;
    }

    let node = OrchestratorNode::new(config, transport, Arc::new(LoggingScheduler))?;
    node.run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_serve(serve_args).await?;
        }
    }

    Ok(())
}
