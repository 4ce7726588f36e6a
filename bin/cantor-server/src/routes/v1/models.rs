//! Model catalog route.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::schemas::v1::models::{ModelListResponse, ModelResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(ModelListResponse, ModelResponse)))]
pub struct ModelsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// List the generation models and the longest clip each can produce.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Supported models", body = ModelListResponse)
    )
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let models = state
        .orchestrator
        .list_capabilities()
        .iter()
        .map(ModelResponse::from)
        .collect();
    Json(ModelListResponse { models })
}
