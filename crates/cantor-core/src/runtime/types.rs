use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a submitted generation task.
///
/// Backed by a random (v4) UUID; the registry additionally refuses to insert
/// an id that is already present, so an id is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a generation task.
///
/// ```text
/// Accepted -> Queued | Processing | Failed
/// Queued -> Processing | Failed
/// Processing -> Completed | Failed
/// Completed, Failed -> (terminal)
/// ```
///
/// `Failed` is reachable from the pre-processing states only when the
/// runtime shuts down before the task could be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Record created, admission not yet decided.
    Accepted,
    /// Waiting for a compute slot.
    Queued,
    /// Holding a compute slot; the inference routine is running.
    Processing,
    /// Artifact written; `output_path` is set (terminal).
    Completed,
    /// Generation failed; `error` is set (terminal).
    Failed,
}

impl TaskStatus {
    /// Returns `true` once no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    ///
    /// Self-transitions are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Accepted => matches!(next, Self::Queued | Self::Processing | Self::Failed),
            Self::Queued => matches!(next, Self::Processing | Self::Failed),
            Self::Processing => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Like [`Self::can_transition_to`] but returns a descriptive error.
    pub fn validate_transition(&self, task_id: TaskId, next: Self) -> Result<(), RuntimeError> {
        if self.can_transition_to(&next) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidTransition {
                task_id,
                from: *self,
                to: next,
            })
        }
    }
}

/// Errors produced by the runtime layer.
///
/// `Clone` so a failure can be stored verbatim in the failed task's record.
/// [`RuntimeError::kind`] gives a stable machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq, Error, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeError {
    /// The submission was malformed; no task was created.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The referenced task does not exist (never did, or was removed).
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// The task exists but has no artifact on disk.
    #[error("artifact not found for task {task_id}")]
    ArtifactNotFound { task_id: TaskId },

    /// The task exists but has not reached the state the caller needs.
    #[error("task {task_id} is not ready (status: {status})")]
    NotReady { task_id: TaskId, status: TaskStatus },

    /// A state-machine transition was rejected.
    #[error("task {task_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The compute device ran out of a resource (typically GPU memory).
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// The inference routine failed for any other reason.
    #[error("inference failed: {message}")]
    Inference { message: String },

    /// Reading or writing an artifact failed.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// The task exceeded its wall-clock budget while processing.
    #[error("generation timed out after {budget:?}")]
    Timeout { budget: Duration },

    /// The runtime is shutting down and can no longer run tasks.
    #[error("runtime shut down")]
    Shutdown,
}

impl RuntimeError {
    /// Stable snake_case code for this error, e.g. `"task_not_found"`.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub(crate) fn storage(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        RuntimeError::Storage {
            message: format!("{context}: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_every_transition() {
        let all = [
            TaskStatus::Accepted,
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ];
        for terminal in [TaskStatus::Completed, TaskStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(&next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn queued_is_optional() {
        assert!(TaskStatus::Accepted.can_transition_to(&TaskStatus::Processing));
        assert!(TaskStatus::Accepted.can_transition_to(&TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(&TaskStatus::Processing));
        assert!(!TaskStatus::Processing.can_transition_to(&TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(&TaskStatus::Completed));
    }

    #[test]
    fn validate_transition_reports_both_ends() {
        let id = TaskId::new();
        let err = TaskStatus::Completed
            .validate_transition(id, TaskStatus::Processing)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::InvalidTransition {
                task_id: id,
                from: TaskStatus::Completed,
                to: TaskStatus::Processing,
            }
        );
        assert!(err.to_string().contains("completed -> processing"));
    }

    #[test]
    fn error_kinds_are_snake_case() {
        let id = TaskId::new();
        assert_eq!(RuntimeError::TaskNotFound { task_id: id }.kind(), "task_not_found");
        assert_eq!(
            RuntimeError::ResourceExhausted { message: "oom".into() }.kind(),
            "resource_exhausted"
        );
        assert_eq!(RuntimeError::Shutdown.kind(), "shutdown");
    }

    #[test]
    fn timeout_message_keeps_sub_second_budgets() {
        let err = RuntimeError::Timeout {
            budget: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "generation timed out after 50ms");
        let err = RuntimeError::Timeout {
            budget: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "generation timed out after 600s");
    }

    #[test]
    fn task_id_round_trips_through_display() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().expect("valid uuid");
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(TaskStatus::Queued.to_string(), "queued");
    }
}
