use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::request::GenerationRequest;
use crate::runtime::types::{RuntimeError, TaskId};

/// Everything an inference backend needs to run one generation.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub task_id: TaskId,
    pub request: Arc<GenerationRequest>,
    /// Private scratch directory; removed by the caller afterwards.
    pub work_dir: PathBuf,
}

/// Encoded audio produced by a backend.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    pub bytes: Bytes,
}

/// Failure reported by an inference backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// The device ran out of memory or another hard resource.
    #[error("{message}")]
    ResourceExhausted { message: String },
    /// The routine failed for any other reason.
    #[error("{message}")]
    Failed { message: String },
    /// The routine exited cleanly but produced nothing usable.
    #[error("{message}")]
    InvalidOutput { message: String },
}

impl From<InferenceError> for RuntimeError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::ResourceExhausted { message } => {
                RuntimeError::ResourceExhausted { message }
            }
            InferenceError::Failed { message } | InferenceError::InvalidOutput { message } => {
                RuntimeError::Inference { message }
            }
        }
    }
}

/// A progress hint emitted while a backend is running.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Completed fraction in `0.0..=1.0`.
    Fraction(f32),
    /// `done` of `total` discrete steps.
    Steps { done: u32, total: u32 },
    /// A named phase with an explicit percentage.
    Phase { percent: u8, message: String },
}

impl ProgressEvent {
    /// Percentage in `0..=100`.
    pub fn percent(&self) -> u8 {
        let fraction = match self {
            ProgressEvent::Fraction(f) => *f,
            ProgressEvent::Steps { done, total } if *total > 0 => *done as f32 / *total as f32,
            ProgressEvent::Steps { .. } => 0.0,
            ProgressEvent::Phase { percent, .. } => return (*percent).min(100),
        };
        if fraction.is_nan() {
            return 0;
        }
        (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ProgressEvent::Phase { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Non-blocking sender half for [`ProgressEvent`]s.
///
/// Hints are best-effort: when the consumer falls behind they are dropped
/// rather than stalling the backend.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink {
    /// A sink and the receiver that drains it.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub fn report(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }

    pub fn fraction(&self, fraction: f32) {
        self.report(ProgressEvent::Fraction(fraction));
    }

    pub fn steps(&self, done: u32, total: u32) {
        self.report(ProgressEvent::Steps { done, total });
    }

    pub fn phase(&self, percent: u8, message: impl Into<String>) {
        self.report(ProgressEvent::Phase {
            percent,
            message: message.into(),
        });
    }
}

/// The GPU-bound routine that turns lyrics and a style prompt into audio.
///
/// Implementations may run for minutes. They must not touch task state; the
/// caller owns the record and the compute slot.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(
        &self,
        job: &GenerationJob,
        progress: ProgressSink,
    ) -> Result<GeneratedAudio, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        assert_eq!(ProgressEvent::Fraction(0.5).percent(), 50);
        assert_eq!(ProgressEvent::Fraction(1.7).percent(), 100);
        assert_eq!(ProgressEvent::Fraction(f32::NAN).percent(), 0);
        assert_eq!(ProgressEvent::Steps { done: 3, total: 4 }.percent(), 75);
        assert_eq!(ProgressEvent::Steps { done: 3, total: 0 }.percent(), 0);
        assert_eq!(
            ProgressEvent::Phase {
                percent: 250,
                message: "x".into()
            }
            .percent(),
            100
        );
    }

    #[test]
    fn oom_maps_to_resource_exhausted() {
        let err: RuntimeError = InferenceError::ResourceExhausted {
            message: "CUDA out of memory".into(),
        }
        .into();
        assert_eq!(err.kind(), "resource_exhausted");

        let err: RuntimeError = InferenceError::InvalidOutput {
            message: "No output file found after generation".into(),
        }
        .into();
        assert_eq!(err.kind(), "inference");
    }

    #[tokio::test]
    async fn full_sink_drops_instead_of_blocking() {
        let (sink, mut rx) = ProgressSink::channel(1);
        sink.fraction(0.1);
        sink.fraction(0.2);
        assert_eq!(rx.recv().await, Some(ProgressEvent::Fraction(0.1)));
        assert!(rx.try_recv().is_err());
    }
}
