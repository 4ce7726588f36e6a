//! Banner and health endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use utoipa::OpenApi;

use crate::state::AppState;

const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(OpenApi)]
#[openapi(paths(get_banner, get_health))]
pub struct HealthApi;

/// Register banner and health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_banner))
        .route("/health", get(get_health))
}

/// Service banner.
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses(
        (status = 200, description = "Service is running", body = Value)
    )
)]
pub async fn get_banner() -> Json<Value> {
    Json(json!({
        "message": "Cantor Music Generation API",
        "version": env!("CARGO_PKG_VERSION"),
        "status":  "running",
    }))
}

/// Liveness plus GPU slot usage.
///
/// `gpu_slots` reflects the admission gate; `gpu_available` and `gpu_info`
/// come from `nvidia-smi` when it is installed.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = Value)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.orchestrator.health().await;
    let (gpu_available, gpu_info) = probe_gpu().await;
    Json(json!({
        "status":  "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "gpu_slots": {
            "capacity":  snapshot.gate.capacity,
            "available": snapshot.gate.available,
            "occupied":  snapshot.gate.occupied,
        },
        "active_generations": snapshot.counts.processing,
        "queued_generations": snapshot.counts.queued,
        "gpu_available": gpu_available,
        "gpu_info": gpu_info,
    }))
}

async fn probe_gpu() -> (bool, Option<String>) {
    let probe = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(GPU_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) if output.status.success() => {
            let info = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            (true, Some(info))
        }
        Ok(Ok(output)) => {
            debug!(status = %output.status, "nvidia-smi reported an error");
            (false, None)
        }
        Ok(Err(e)) => {
            debug!(error = %e, "nvidia-smi not available");
            (false, None)
        }
        Err(_) => {
            warn!(timeout_secs = GPU_PROBE_TIMEOUT.as_secs(), "nvidia-smi timed out");
            (false, None)
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
