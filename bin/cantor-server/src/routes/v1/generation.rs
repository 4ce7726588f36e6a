//! Generation routes: submission, status polling, download and cleanup.
//!
//! Generation itself runs on the orchestrator's workers; every handler here
//! returns without waiting for the GPU except `POST /v1/generations/sync`,
//! which blocks until the task finishes or `CANTOR_SYNC_WAIT_SECS` elapses.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cantor_core::{RuntimeError, TaskId};
use tracing::{debug, info};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::generation::{
    CleanupResponse, GenerateMusicForm, GenerationBody, SubmissionResponse,
    SyncGenerationResponse, TaskStatusResponse,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        generate_music,
        create_generation,
        run_generation,
        get_status,
        download,
        cleanup
    ),
    components(schemas(
        CleanupResponse,
        GenerateMusicForm,
        GenerationBody,
        SubmissionResponse,
        SyncGenerationResponse,
        TaskStatusResponse
    ))
)]
pub struct GenerationApi;

/// Register generation routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate-music", post(generate_music))
        .route("/generations", post(create_generation))
        .route("/generations/sync", post(run_generation))
        .route("/generations/{task_id}", get(get_status).delete(cleanup))
        .route("/generations/{task_id}/audio", get(download))
        .route("/status/{task_id}", get(get_status))
        .route("/download/{task_id}", get(download))
        .route("/cleanup/{task_id}", delete(cleanup))
}

/// Submit a generation from an uploaded LRC file (`multipart/form-data`).
///
/// Returns as soon as the task is admitted; poll `GET /v1/status/{task_id}`.
#[utoipa::path(
    post,
    path = "/v1/generate-music",
    tag = "generation",
    request_body(content = GenerateMusicForm, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Task accepted", body = SubmissionResponse),
        (status = 400, description = "Invalid parameters or lyric file"),
        (status = 413, description = "Lyric file too large"),
    )
)]
pub async fn generate_music(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmissionResponse>), ServerError> {
    let limit = state.config.max_upload_size_bytes();
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut body = GenerationBody::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "lrc_file" => {
                let file_name = field.file_name().unwrap_or_default().to_owned();
                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read lyric file: {e}")))?
                {
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() > limit {
                        return Err(ServerError::PayloadTooLarge(format!(
                            "lyric file exceeds the maximum of {}MB",
                            state.config.max_upload_size_mb
                        )));
                    }
                }
                upload = Some((file_name, bytes));
            }
            "ref_prompt" | "audio_length" | "model_id" | "batch_infer_num" | "use_chunked" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field {name}: {e}")))?;
                apply_form_field(&mut body, &name, value)?;
            }
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }

    let (file_name, bytes) =
        upload.ok_or_else(|| ServerError::BadRequest("lrc_file is required".into()))?;
    body.lrc_content = String::from_utf8(bytes)
        .map_err(|_| ServerError::BadRequest("lyric file must be UTF-8 text".into()))?;
    let request = body
        .into_request()
        .map_err(ServerError::BadRequest)?
        .with_file_name(file_name);

    let submission = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission.into())))
}

/// Submit a generation with the lyrics inline as JSON.
#[utoipa::path(
    post,
    path = "/v1/generations",
    tag = "generation",
    request_body = GenerationBody,
    responses(
        (status = 202, description = "Task accepted", body = SubmissionResponse),
        (status = 400, description = "Invalid parameters"),
    )
)]
pub async fn create_generation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmissionResponse>), ServerError> {
    let Json(body) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let request = body.into_request().map_err(ServerError::BadRequest)?;
    let submission = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission.into())))
}

/// Generate and wait for the result, returning the audio base64-encoded.
///
/// The task is forgotten once answered. Failures keep the HTTP status of the
/// underlying error but always answer with `{success: false, error}`.
#[utoipa::path(
    post,
    path = "/v1/generations/sync",
    tag = "generation",
    request_body = GenerationBody,
    responses(
        (status = 200, description = "Generation finished", body = SyncGenerationResponse),
        (status = 400, description = "Invalid parameters", body = SyncGenerationResponse),
        (status = 500, description = "Generation failed", body = SyncGenerationResponse),
        (status = 504, description = "Generation did not finish in time", body = SyncGenerationResponse),
    )
)]
pub async fn run_generation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationBody>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(body)) => match body.into_request() {
            Ok(request) => request,
            Err(message) => return sync_failure(ServerError::BadRequest(message)),
        },
        Err(rejection) => return sync_failure(ServerError::BadRequest(rejection.body_text())),
    };

    let echo = request.clone();
    let wait = Duration::from_secs(state.config.sync_wait_secs);
    match state.orchestrator.run(request, wait).await {
        Ok(generated) => {
            info!(
                task_id = %generated.task_id,
                size = generated.size,
                elapsed_ms = generated.elapsed.as_millis() as u64,
                "synchronous generation answered"
            );
            let audio = STANDARD.encode(&generated.bytes);
            Json(SyncGenerationResponse::completed(&generated, audio, &echo)).into_response()
        }
        Err(err) => sync_failure(err.into()),
    }
}

fn sync_failure(err: ServerError) -> Response {
    let (status, _, message) = err.parts();
    // Generation failures are already visible through the status endpoint.
    let message = match &err {
        ServerError::Runtime(
            e @ (RuntimeError::Inference { .. } | RuntimeError::ResourceExhausted { .. }),
        ) => e.to_string(),
        _ => message,
    };
    (status, Json(SyncGenerationResponse::failed(message))).into_response()
}

/// Current state of a task.
#[utoipa::path(
    get,
    path = "/v1/status/{task_id}",
    tag = "generation",
    params(("task_id" = String, Path, description = "Task id returned at submission")),
    responses(
        (status = 200, description = "Task state", body = TaskStatusResponse),
        (status = 400, description = "Malformed task id"),
        (status = 404, description = "Unknown task"),
    )
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let view = state.orchestrator.get_status(task_id).await?;
    Ok(Json(view.into()))
}

/// Download the generated audio of a completed task.
#[utoipa::path(
    get,
    path = "/v1/download/{task_id}",
    tag = "generation",
    params(("task_id" = String, Path, description = "Task id returned at submission")),
    responses(
        (status = 200, description = "Audio file (`audio/wav` or `audio/mpeg`)"),
        (status = 404, description = "Unknown task or no artifact"),
        (status = 409, description = "Generation not finished yet"),
    )
)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let artifact = state.orchestrator.download(task_id).await?;
    debug!(%task_id, size = artifact.bytes.len(), "serving artifact");
    Ok((
        [
            (header::CONTENT_TYPE, artifact.format.content_type().to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.file_name),
            ),
        ],
        artifact.bytes,
    )
        .into_response())
}

/// Delete a finished task's audio and forget the task.
#[utoipa::path(
    delete,
    path = "/v1/cleanup/{task_id}",
    tag = "generation",
    params(("task_id" = String, Path, description = "Task id returned at submission")),
    responses(
        (status = 200, description = "Task removed", body = CleanupResponse),
        (status = 404, description = "Unknown task"),
        (status = 409, description = "Generation still running"),
    )
)]
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<CleanupResponse>, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    state.orchestrator.cleanup(task_id).await?;
    Ok(Json(CleanupResponse {
        message: "Cleanup completed".to_owned(),
    }))
}

fn parse_task_id(raw: &str) -> Result<TaskId, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid task id: {raw}")))
}

fn apply_form_field(body: &mut GenerationBody, name: &str, value: String) -> Result<(), ServerError> {
    let value = value.trim();
    match name {
        "ref_prompt" => body.ref_prompt = value.to_owned(),
        "model_id" if !value.is_empty() => body.model_id = Some(value.to_owned()),
        "audio_length" if !value.is_empty() => {
            body.audio_length = Some(value.parse().map_err(|_| {
                ServerError::BadRequest(format!("audio_length must be a number (got {value})"))
            })?);
        }
        "batch_infer_num" if !value.is_empty() => {
            body.batch_infer_num = Some(value.parse().map_err(|_| {
                ServerError::BadRequest(format!("batch_infer_num must be a number (got {value})"))
            })?);
        }
        "use_chunked" if !value.is_empty() => {
            body.use_chunked = Some(parse_form_bool(value).ok_or_else(|| {
                ServerError::BadRequest(format!("use_chunked must be a boolean (got {value})"))
            })?);
        }
        _ => {}
    }
    Ok(())
}

fn parse_form_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
