//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection, upload limit)
//! - Optional Swagger UI / OpenAPI document endpoint (disable with `CANTOR_ENABLE_SWAGGER=false`)
//! - Banner and health routes at the root
//! - Generation routes under `/v1`

pub mod doc;
mod health;
mod v1;

#[cfg(test)]
mod tests;

use axum::extract::DefaultBodyLimit;
use axum::http::Uri;
use axum::{
    middleware::{self},
    Router,
};
use crate::error::ServerError;
use crate::middleware::{cors, trace};
use crate::state::AppState;
use std::sync::Arc;
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

/// Room for multipart boundaries and the small text fields around the file.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router());

    let mut app = Router::new().merge(api_router);

    // ── Swagger UI ────────────────────────────────────────────────────────────
    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    let body_limit = state
        .config
        .max_upload_size_bytes()
        .saturating_add(FORM_OVERHEAD_BYTES);

    app.fallback(unknown_route)
        // Outermost layers execute first on the way in.
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

async fn unknown_route(uri: Uri) -> ServerError {
    ServerError::NotFound(format!("no route for {}", uri.path()))
}
