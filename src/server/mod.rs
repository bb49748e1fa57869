//! HTTP control surface: start, stop and inspect the background job.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::crawler::{ControlError, JobController};
use crate::storage::snapshot::{self, HousesView, StreetsView};
use crate::storage::{JobStatus, SnapshotDir};

const USAGE: &str = "house-bot control surface: POST /run, POST /stop, GET /status, \
GET /processed-houses, GET /processed-houses/list";

/// Shared state for the control surface
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobController>,
    pub snapshots: SnapshotDir,
}

/// Body of `POST /run`; every field is optional
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub cycles: u32,
    pub hours: Option<f64>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            cycles: 1,
            hours: None,
        }
    }
}

impl RunRequest {
    /// Empty or whitespace-only bodies mean "use defaults".
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/run", post(run_job))
        .route("/stop", post(stop_job))
        .route("/status", get(job_status))
        .route("/processed-houses", get(processed_houses))
        .route("/processed-houses/list", get(processed_houses_list))
        .with_state(state)
}

async fn index() -> &'static str {
    USAGE
}

async fn run_job(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let request = match RunRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected run request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "invalid_request", "error": e.to_string() })),
            );
        }
    };

    match state.jobs.request_start(request.cycles, request.hours) {
        Ok(status) => {
            info!(cycles = status.cycles, hours = ?status.hours, "Job accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "started", "cycles": status.cycles, "hours": status.hours })),
            )
        }
        Err(ControlError::AlreadyRunning) => (StatusCode::CONFLICT, Json(json!({ "status": "busy" }))),
        Err(e) => control_failure(e),
    }
}

async fn stop_job(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.jobs.request_stop() {
        Ok(_) => {
            info!("Stop requested");
            (StatusCode::OK, Json(json!({ "status": "stop_requested" })))
        }
        Err(ControlError::NotRunning) => (StatusCode::BAD_REQUEST, Json(json!({ "status": "not_running" }))),
        Err(e) => control_failure(e),
    }
}

fn control_failure(e: ControlError) -> (StatusCode, Json<Value>) {
    error!("Control request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "error": e.to_string() })),
    )
}

async fn job_status(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.jobs.get_status())
}

async fn processed_houses(State(state): State<AppState>) -> Json<HousesView> {
    Json(snapshot::houses_view(&state.snapshots))
}

async fn processed_houses_list(State(state): State<AppState>) -> Json<StreetsView> {
    Json(snapshot::streets_view(&state.snapshots))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Control surface shutting down");
}

/// Serve the control surface until Ctrl-C. A `running` flag left over from
/// a crashed process is cleared first.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    state.jobs.recover_stale()?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Control surface listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Control surface failed")?;

    Ok(())
}
