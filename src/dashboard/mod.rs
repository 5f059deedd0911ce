use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::FlotillaError;
use crate::jobstore::{JobStateStore, JobStore};
use crate::models::{Evaluation, Execution, Job, JobType, Task};
use crate::orchestrator::{BrokerStats, InMemoryEvaluationBroker, JobSubmitter};
use crate::routing::{InMemoryNodeInfoStore, NodeInfoStore};
use crate::transport::{DebugInfo, DebugInfoProvider};

#[derive(Clone)]
pub struct DashboardState {
    pub node_id: String,
    pub broker: InMemoryEvaluationBroker,
    pub store: Arc<dyn JobStateStore>,
    pub nodes: Arc<InMemoryNodeInfoStore>,
    pub submitter: JobSubmitter,
    pub debug_providers: Vec<Arc<dyn DebugInfoProvider>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    broker_enabled: bool,
}

#[derive(Serialize)]
struct BrokerResponse {
    stats: BrokerStats,
    failed: Vec<Evaluation>,
}

#[derive(Deserialize)]
struct SubmitTask {
    name: String,
    engine: String,
    #[serde(default)]
    execution_timeout_secs: u64,
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    name: String,
    job_type: JobType,
    tasks: Vec<SubmitTask>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    evaluation_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct JobDetailResponse {
    job: Job,
    executions: Vec<Execution>,
    evaluations: Vec<Evaluation>,
}

/// Operator API routes, without binding a listener.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/broker", get(broker_handler))
        .route("/api/nodes", get(nodes_handler))
        .route("/api/debug", get(debug_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/:id", get(job_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the operator API until `shutdown` is cancelled.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        broker_enabled: !state.broker.is_closed().await,
    })
}

async fn broker_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(BrokerResponse {
        stats: state.broker.stats().await,
        failed: state.broker.failed_evaluations().await,
    })
}

async fn nodes_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.nodes.list().await)
}

async fn debug_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let info: Vec<DebugInfo> = state
        .debug_providers
        .iter()
        .map(|provider| provider.debug_info())
        .collect();
    Json(info)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let tasks = payload
        .tasks
        .into_iter()
        .map(|t| {
            Task::new(t.name, t.engine)
                .with_execution_timeout(Duration::from_secs(t.execution_timeout_secs))
        })
        .collect();
    let job = Job::new(payload.name, payload.job_type, tasks);
    let job_id = job.id;

    match state.submitter.submit(job).await {
        Ok(evaluation) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id.to_string()),
                evaluation_id: Some(evaluation.id.to_string()),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match &e {
                FlotillaError::InvalidJob(_) | FlotillaError::InvalidEvaluation(_) => {
                    StatusCode::BAD_REQUEST
                }
                FlotillaError::BrokerClosed => StatusCode::SERVICE_UNAVAILABLE,
                e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(SubmitJobResponse {
                    success: false,
                    job_id: None,
                    evaluation_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let job = match state.store.get_job(&id).await {
        Ok(job) => job,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };
    let executions = match state.store.get_executions(&id).await {
        Ok(executions) => executions,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let evaluations = match state.store.evaluations_for_job(&id).await {
        Ok(evaluations) => evaluations,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    Json(JobDetailResponse {
        job,
        executions,
        evaluations,
    })
    .into_response()
}
