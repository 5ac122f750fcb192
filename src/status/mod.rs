//! Read-only HTTP view of the worker: liveness, load and in-flight jobs.

use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::worker::{JobExecutionEngine, TrackedJob};

#[derive(Clone)]
pub struct StatusState {
    pub engine: JobExecutionEngine,
    pub max_running_jobs: usize,
    pub worker_id: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct WorkerStatusResponse {
    worker_id: String,
    running_jobs: usize,
    max_running_jobs: usize,
}

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/worker", get(worker_status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the status endpoint until `shutdown` is cancelled.
pub async fn run_status_server(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn worker_status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(WorkerStatusResponse {
        worker_id: state.worker_id.clone(),
        running_jobs: state.engine.running_count(),
        max_running_jobs: state.max_running_jobs,
    })
}

async fn list_jobs_handler(State(state): State<StatusState>) -> Json<Vec<TrackedJob>> {
    Json(state.engine.running_jobs())
}
