//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use cantor_core::{
    GeneratedAudio, GenerationJob, InferenceBackend, InferenceError, Orchestrator, ProgressSink,
    TaskId, TaskStatus,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use crate::config::Config;
use crate::state::AppState;

const LYRICS: &str = "[00:10.00]first line\n[00:15.00]second line";
const BOUNDARY: &str = "cantor-test-boundary";

fn wav() -> Bytes {
    let mut b = Vec::new();
    b.extend_from_slice(b"RIFF");
    b.extend_from_slice(&68u32.to_le_bytes());
    b.extend_from_slice(b"WAVE");
    b.extend_from_slice(&[7u8; 64]);
    Bytes::from(b)
}

// ── Stub backend ──────────────────────────────────────────────────────────────

/// `hold` waits for [`StubBackend::release`], `fail` errors, anything else
/// returns a small WAV immediately.
struct StubBackend {
    hold: Semaphore,
}

impl StubBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hold: Semaphore::new(0),
        })
    }

    fn release(&self) {
        self.hold.add_permits(1);
    }
}

#[async_trait]
impl InferenceBackend for StubBackend {
    async fn generate(
        &self,
        job: &GenerationJob,
        progress: ProgressSink,
    ) -> Result<GeneratedAudio, InferenceError> {
        match job.request.style_prompt.split_whitespace().next() {
            Some("hold") => {
                if let Ok(permit) = self.hold.acquire().await {
                    permit.forget();
                }
            }
            Some("fail") => {
                return Err(InferenceError::Failed {
                    message: "Generation process failed: model weights missing".into(),
                })
            }
            _ => {}
        }
        progress.fraction(1.0);
        Ok(GeneratedAudio { bytes: wav() })
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    app: Router,
    orchestrator: Orchestrator,
    backend: Arc<StubBackend>,
    _dir: TempDir,
}

async fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = Config {
        output_dir: dir.path().to_path_buf(),
        sync_wait_secs: 5,
        ..Config::default()
    };
    configure(&mut cfg);

    let backend = StubBackend::new();
    let orchestrator = Orchestrator::start(cfg.runtime(), backend.clone())
        .await
        .expect("start orchestrator");
    let state = Arc::new(AppState {
        config: Arc::new(cfg),
        orchestrator: orchestrator.clone(),
    });
    Harness {
        app: crate::routes::build(state),
        orchestrator,
        backend,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

impl Harness {
    async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = self.app.clone().oneshot(req).await.expect("router is infallible");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("read body").to_bytes();
        (status, headers, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let req = Request::get(uri).body(Body::empty()).expect("request");
        let (status, _, body) = self.send(req).await;
        (status, to_json(&body))
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let (status, _, body) = self.send(req).await;
        (status, to_json(&body))
    }

    async fn submit(&self, prompt: &str) -> TaskId {
        let (status, body) = self
            .post_json(
                "/v1/generations",
                json!({ "lrc_content": LYRICS, "ref_prompt": prompt }),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        body["task_id"]
            .as_str()
            .and_then(|id| id.parse().ok())
            .expect("task id")
    }

    async fn wait_status(&self, task_id: TaskId, want: TaskStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let view = self.orchestrator.get_status(task_id).await.expect("task exists");
            if view.status == want {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} stuck in {} waiting for {want}",
                view.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn to_json(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

fn multipart(file_name: &str, lyrics: &str, prompt: &str) -> Request<Body> {
    let body = format!(
        "--{b}\r\n\
         Content-Disposition: form-data; name=\"lrc_file\"; filename=\"{file_name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         {lyrics}\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"ref_prompt\"\r\n\r\n\
         {prompt}\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"audio_length\"\r\n\r\n\
         95\r\n\
         --{b}--\r\n",
        b = BOUNDARY
    );
    Request::post("/v1/generate-music")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}

// ── Banner, health and catalog ────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_gpu_slots() {
    let h = harness().await;
    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["gpu_slots"]["capacity"], 1);
    assert_eq!(body["gpu_slots"]["available"], 1);
    assert_eq!(body["active_generations"], 0);
    assert!(body["gpu_available"].is_boolean());
}

#[tokio::test]
async fn banner_is_served_at_the_root() {
    let h = harness().await;
    let (status, body) = h.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
}

#[tokio::test]
async fn models_lists_the_catalog() {
    let h = harness().await;
    let (status, body) = h.get("/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    let models = body["models"].as_array().expect("models array");
    assert_eq!(models.len(), 3);
    assert!(models
        .iter()
        .any(|m| m["id"] == "ASLP-lab/DiffRhythm-full" && m["max_length"] == 285));
}

#[tokio::test]
async fn openapi_document_is_published() {
    let h = harness().await;
    let (status, body) = h.get("/api-docs/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/generate-music"].is_object());
}

#[tokio::test]
async fn trace_id_is_echoed() {
    let h = harness().await;
    let trace_id = "6f1c2a5e-8d3b-4c7a-9e0f-112233445566";
    let req = Request::get("/")
        .header("x-trace-id", trace_id)
        .body(Body::empty())
        .expect("request");
    let (_, headers, _) = h.send(req).await;
    assert_eq!(headers["x-trace-id"], trace_id);
}

#[tokio::test]
async fn unknown_route_is_a_json_404() {
    let h = harness().await;
    let (status, body) = h.get("/v2/nothing-here").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

// ── Submission ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn json_submission_is_accepted() {
    let h = harness().await;
    let (status, body) = h
        .post_json(
            "/v1/generations",
            json!({ "lrc_content": LYRICS, "ref_prompt": "hold jazz" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "processing");
    assert_eq!(body["message"], "Music generation started");
    assert!(body["estimated_time"].is_string());
    h.backend.release();
}

#[tokio::test]
async fn second_submission_is_queued_behind_the_first() {
    let h = harness().await;
    let first = h.submit("hold one").await;
    let (status, body) = h
        .post_json(
            "/v1/generations",
            json!({ "lrc_content": LYRICS, "ref_prompt": "hold two" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["queue_position"], 1);

    h.backend.release();
    h.wait_status(first, TaskStatus::Completed).await;
    h.backend.release();
}

#[tokio::test]
async fn blank_prompt_is_a_validation_error() {
    let h = harness().await;
    let (status, body) = h
        .post_json(
            "/v1/generations",
            json!({ "lrc_content": LYRICS, "ref_prompt": "   " }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
    assert!(h.orchestrator.health().await.counts == Default::default());
}

#[tokio::test]
async fn unsupported_length_is_a_bad_request() {
    let h = harness().await;
    let (status, body) = h
        .post_json(
            "/v1/generations",
            json!({ "lrc_content": LYRICS, "ref_prompt": "pop", "audio_length": 120 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let h = harness().await;
    let req = Request::post("/v1/generations")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _, body) = h.send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(to_json(&body)["code"], "bad_request");
}

#[tokio::test]
async fn lrc_upload_is_accepted() {
    let h = harness().await;
    let (status, _, body) = h.send(multipart("song.lrc", LYRICS, "ambient")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id: TaskId = to_json(&body)["task_id"]
        .as_str()
        .and_then(|id| id.parse().ok())
        .expect("task id");
    h.wait_status(task_id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn non_lrc_upload_is_rejected() {
    let h = harness().await;
    let (status, _, body) = h.send(multipart("song.txt", LYRICS, "ambient")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(to_json(&body)["code"], "validation");
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let h = harness_with(|cfg| cfg.max_upload_size_mb = 0).await;
    let (status, _, body) = h.send(multipart("song.lrc", LYRICS, "ambient")).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(to_json(&body)["code"], "payload_too_large");
}

// ── Status, download and cleanup ──────────────────────────────────────────────

#[tokio::test]
async fn unknown_task_is_not_found() {
    let h = harness().await;
    let (status, body) = h.get(&format!("/v1/status/{}", TaskId::new())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "task_not_found");

    let (status, _) = h.get("/v1/status/not-a-task").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn download_waits_for_completion_then_serves_audio() {
    let h = harness().await;
    let task_id = h.submit("hold ballad").await;

    let (status, body) = h.get(&format!("/v1/download/{task_id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "not_ready");

    h.backend.release();
    h.wait_status(task_id, TaskStatus::Completed).await;

    let (status, body) = h.get(&format!("/v1/generations/{task_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["output_size"], wav().len());

    let req = Request::get(format!("/v1/download/{task_id}"))
        .body(Body::empty())
        .expect("request");
    let (status, headers, bytes) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "audio/wav");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"generated_music_{task_id}.wav\"").as_str()
    );
    assert_eq!(bytes, wav());
}

#[tokio::test]
async fn failed_task_reports_its_error() {
    let h = harness().await;
    let task_id = h.submit("fail metal").await;
    h.wait_status(task_id, TaskStatus::Failed).await;

    let (status, body) = h.get(&format!("/v1/status/{task_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().unwrap_or("").contains("model weights missing"));

    let (status, _) = h.get(&format!("/v1/download/{task_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cleanup_forgets_a_finished_task() {
    let h = harness().await;
    let task_id = h.submit("folk").await;
    h.wait_status(task_id, TaskStatus::Completed).await;

    let req = Request::delete(format!("/v1/cleanup/{task_id}"))
        .body(Body::empty())
        .expect("request");
    let (status, _, body) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(to_json(&body), json!({ "message": "Cleanup completed" }));

    let (status, _) = h.get(&format!("/v1/status/{task_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cleanup_refuses_a_running_task() {
    let h = harness().await;
    let task_id = h.submit("hold drone").await;
    let req = Request::delete(format!("/v1/generations/{task_id}"))
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = h.send(req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    h.backend.release();
}

// ── Synchronous generation ────────────────────────────────────────────────────

#[tokio::test]
async fn sync_generation_returns_base64_audio() {
    let h = harness().await;
    let (status, body) = h
        .post_json(
            "/v1/generations/sync",
            json!({ "lrc_content": LYRICS, "ref_prompt": "synthwave" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["audio_length"], 95);
    assert_eq!(body["model_used"], "ASLP-lab/DiffRhythm-1_2");
    assert_eq!(body["prompt"], "synthwave");
    assert_eq!(body["file_size"], wav().len());
    let audio = STANDARD
        .decode(body["audio_base64"].as_str().expect("audio"))
        .expect("base64");
    assert_eq!(Bytes::from(audio), wav());
    assert!(h.orchestrator.health().await.counts == Default::default());
}

#[tokio::test]
async fn sync_generation_reports_failures() {
    let h = harness().await;
    let (status, body) = h
        .post_json(
            "/v1/generations/sync",
            json!({ "lrc_content": LYRICS, "ref_prompt": "fail grunge" }),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap_or("").contains("model weights missing"));
}

#[tokio::test]
async fn sync_generation_rejects_missing_lyrics() {
    let h = harness().await;
    let (status, body) = h
        .post_json("/v1/generations/sync", json!({ "ref_prompt": "pop" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}
