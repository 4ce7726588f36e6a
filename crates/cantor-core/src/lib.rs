//! Task orchestration for a GPU-bound lyric-to-song generator.
//!
//! Callers submit a [`GenerationRequest`] to the [`Orchestrator`], which
//! registers a task, waits for a free compute slot, drives the configured
//! [`InferenceBackend`] and stores the resulting audio until it is
//! downloaded or cleaned up.

pub mod catalog;
pub mod config;
pub mod request;
pub mod runtime;

pub use catalog::{ModelInfo, DEFAULT_MODEL_ID};
pub use config::{CleanupPolicy, Config};
pub use request::{AudioLength, GenerationRequest};
pub use runtime::artifact::{ArtifactStore, AudioFormat, StoredArtifact};
pub use runtime::backend::{
    AdmissionGate, CommandBackend, GateStats, GeneratedAudio, GenerationJob, InferenceBackend,
    InferenceError, ProgressEvent, ProgressSink,
};
pub use runtime::orchestrator::{Artifact, Generated, HealthSnapshot, Orchestrator, Submission};
pub use runtime::registry::{StatusCounts, TaskRecord, TaskRegistry, TaskStatusView};
pub use runtime::retention::RetentionPolicy;
pub use runtime::types::{RuntimeError, TaskId, TaskStatus};
