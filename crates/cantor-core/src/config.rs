//! Runtime configuration for the generation service.

use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::retention::RetentionPolicy;

/// What happens to an artifact once it has been downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Keep it until an explicit cleanup or the retention sweeper.
    #[default]
    Retain,
    /// Delete the artifact and forget the task right after the first
    /// successful download.
    DeleteAfterDownload,
}

/// Settings consumed by [`crate::Orchestrator::start`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for artifacts; one subdirectory per task.
    pub output_dir: PathBuf,
    /// Number of generations allowed on the device at once.
    pub gpu_slots: usize,
    /// Wall-clock budget for a single generation, measured from promotion
    /// to `processing`.
    pub task_timeout: Duration,
    /// Smallest progress change, in percent, worth writing to the registry.
    pub progress_step: u8,
    /// Largest accepted `batch_count`.
    pub max_batch: u32,
    pub cleanup: CleanupPolicy,
    /// Background expiry of finished tasks. `None` keeps them forever.
    pub retention: Option<RetentionPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            gpu_slots: 1,
            task_timeout: Duration::from_secs(600),
            progress_step: 1,
            max_batch: 4,
            cleanup: CleanupPolicy::Retain,
            retention: None,
        }
    }
}
