//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use cantor_core::{CleanupPolicy, RetentionPolicy};

/// Runtime configuration for cantor-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Root directory for generated audio (default: `"./output"`).
    pub output_dir: PathBuf,

    /// Generations allowed on the GPU at once.
    pub gpu_slots: usize,

    /// Wall-clock budget for a single generation.
    pub task_timeout_secs: u64,

    /// Forget a task as soon as its audio has been downloaded once.
    pub delete_after_download: bool,

    /// Age after which finished tasks are swept; `0` disables the sweeper.
    pub retention_secs: u64,

    pub sweep_interval_secs: u64,

    /// Largest accepted lyric upload.
    pub max_upload_size_mb: usize,

    /// Comma-separated CORS origins; unset means wildcard.
    pub cors_allowed_origins: Option<String>,

    /// Serve Swagger UI at `/swagger-ui`.
    pub enable_swagger: bool,

    /// Interpreter that runs the inference script (default: `"python3"`).
    pub infer_program: String,

    /// Inference entry point, relative to `infer_workdir` (default: `"infer/infer.py"`).
    pub infer_script: String,

    /// Checkout of the model code; the script runs here.
    pub infer_workdir: Option<PathBuf>,

    /// Value for `CUDA_VISIBLE_DEVICES`.
    pub cuda_device: String,

    /// How long `POST /v1/generations/sync` waits for a result.
    pub sync_wait_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            output_dir: PathBuf::from("./output"),
            gpu_slots: 1,
            task_timeout_secs: 600,
            delete_after_download: false,
            retention_secs: 0,
            sweep_interval_secs: 300,
            max_upload_size_mb: 10,
            cors_allowed_origins: None,
            enable_swagger: true,
            infer_program: "python3".to_owned(),
            infer_script: "infer/infer.py".to_owned(),
            infer_workdir: None,
            cuda_device: "0".to_owned(),
            sync_wait_secs: 1800,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: env_or("CANTOR_BIND", &defaults.bind_address),
            log_level: env_or("CANTOR_LOG", &defaults.log_level),
            log_json: parse_bool("CANTOR_LOG_JSON", defaults.log_json),
            output_dir: std::env::var_os("CANTOR_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            gpu_slots: parse_env("CANTOR_GPU_SLOTS", defaults.gpu_slots),
            task_timeout_secs: parse_env("CANTOR_TASK_TIMEOUT_SECS", defaults.task_timeout_secs),
            delete_after_download: parse_bool(
                "CANTOR_DELETE_AFTER_DOWNLOAD",
                defaults.delete_after_download,
            ),
            retention_secs: parse_env("CANTOR_RETENTION_SECS", defaults.retention_secs),
            sweep_interval_secs: parse_env(
                "CANTOR_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            max_upload_size_mb: parse_env("CANTOR_MAX_UPLOAD_SIZE_MB", defaults.max_upload_size_mb),
            cors_allowed_origins: std::env::var("CANTOR_CORS_ORIGINS").ok(),
            enable_swagger: parse_bool("CANTOR_ENABLE_SWAGGER", defaults.enable_swagger),
            infer_program: env_or("CANTOR_INFER_PROGRAM", &defaults.infer_program),
            infer_script: env_or("CANTOR_INFER_SCRIPT", &defaults.infer_script),
            infer_workdir: std::env::var_os("CANTOR_INFER_WORKDIR").map(PathBuf::from),
            cuda_device: env_or("CANTOR_CUDA_DEVICE", &defaults.cuda_device),
            sync_wait_secs: parse_env("CANTOR_SYNC_WAIT_SECS", defaults.sync_wait_secs),
        }
    }

    /// Settings for the generation runtime.
    pub fn runtime(&self) -> cantor_core::Config {
        let retention = (self.retention_secs > 0).then(|| {
            RetentionPolicy::new(
                Duration::from_secs(self.retention_secs),
                Duration::from_secs(self.sweep_interval_secs),
            )
        });
        cantor_core::Config {
            output_dir: self.output_dir.clone(),
            gpu_slots: self.gpu_slots,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            cleanup: if self.delete_after_download {
                CleanupPolicy::DeleteAfterDownload
            } else {
                CleanupPolicy::Retain
            },
            retention,
            ..cantor_core::Config::default()
        }
    }

    pub fn max_upload_size_bytes(&self) -> usize {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
