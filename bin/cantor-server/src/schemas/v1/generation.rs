use cantor_core::{
    AudioLength, Generated, GenerationRequest, Submission, TaskStatus, TaskStatusView,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const ESTIMATED_TIME: &str = "2-5 minutes depending on length and hardware";

/// JSON body of `POST /v1/generations` and `POST /v1/generations/sync`.
///
/// Missing lyrics or prompt deserialize as empty strings so that they are
/// reported by request validation rather than as a JSON rejection.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct GenerationBody {
    /// LRC lyrics, one `[mm:ss.xx]` timestamped line per lyric.
    #[serde(default)]
    pub lrc_content: String,
    /// Style description, e.g. "Jazzy nightclub vibe".
    #[serde(default)]
    pub ref_prompt: String,
    /// Clip length in seconds: 95 or 285.
    #[serde(default)]
    pub audio_length: Option<u32>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub batch_infer_num: Option<u32>,
    #[serde(default)]
    pub use_chunked: Option<bool>,
}

impl GenerationBody {
    /// Convert to a runtime request. Only the length is checked here; the
    /// orchestrator validates everything else.
    pub fn into_request(self) -> Result<GenerationRequest, String> {
        let mut request = GenerationRequest::new(self.lrc_content, self.ref_prompt);
        if let Some(seconds) = self.audio_length {
            request = request.with_audio_length(AudioLength::try_from(seconds)?);
        }
        if let Some(model_id) = self.model_id {
            request = request.with_model(model_id);
        }
        if let Some(batch) = self.batch_infer_num {
            request = request.with_batch_count(batch);
        }
        if let Some(chunked) = self.use_chunked {
            request = request.with_chunked(chunked);
        }
        Ok(request)
    }
}

/// Multipart form of `POST /v1/generate-music`.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
pub struct GenerateMusicForm {
    /// LRC lyric file; the name must end in `.lrc`.
    #[schema(value_type = String, format = Binary)]
    pub lrc_file: Vec<u8>,
    pub ref_prompt: String,
    #[schema(default = 95)]
    pub audio_length: Option<u32>,
    #[schema(default = "ASLP-lab/DiffRhythm-1_2")]
    pub model_id: Option<String>,
    #[schema(default = 1)]
    pub batch_infer_num: Option<u32>,
    #[schema(default = true)]
    pub use_chunked: Option<bool>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubmissionResponse {
    pub task_id: String,
    /// `processing` when a GPU slot was free, otherwise `queued`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub message: String,
    pub estimated_time: String,
}

impl From<Submission> for SubmissionResponse {
    fn from(submission: Submission) -> Self {
        let message = match (submission.status, submission.position) {
            (TaskStatus::Queued, Some(position)) => {
                format!("Music generation queued (position {position})")
            }
            _ => "Music generation started".to_owned(),
        };
        Self {
            task_id: submission.task_id.to_string(),
            status: submission.status.to_string(),
            queue_position: submission.position,
            message,
            estimated_time: ESTIMATED_TIME.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    /// One of `accepted`, `queued`, `processing`, `completed`, `failed`.
    pub status: String,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub message: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TaskStatusView> for TaskStatusResponse {
    fn from(view: TaskStatusView) -> Self {
        Self {
            task_id: view.task_id.to_string(),
            status: view.status.to_string(),
            progress: view.progress,
            message: view.message,
            created_at: view.created_at.to_rfc3339(),
            output_path: view.output_path.map(|p| p.display().to_string()),
            output_size: view.output_size,
            error: view.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CleanupResponse {
    pub message: String,
}

/// Reply of `POST /v1/generations/sync`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SyncGenerationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Seconds from submission to completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncGenerationResponse {
    pub fn completed(generated: &Generated, audio_base64: String, request: &GenerationRequest) -> Self {
        Self {
            success: true,
            audio_base64: Some(audio_base64),
            file_size: Some(generated.size),
            generation_time: Some(generated.elapsed.as_secs_f64()),
            audio_length: Some(request.audio_length.seconds()),
            model_used: Some(request.model_id.clone()),
            prompt: Some(request.style_prompt.clone()),
            message: Some("Music generation completed successfully".to_owned()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            audio_base64: None,
            file_size: None,
            generation_time: None,
            audio_length: None,
            model_used: None,
            prompt: None,
            message: None,
            error: Some(error.into()),
        }
    }
}
