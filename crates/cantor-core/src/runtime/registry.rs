use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::request::GenerationRequest;
use crate::runtime::artifact::{AudioFormat, StoredArtifact};
use crate::runtime::types::{RuntimeError, TaskId, TaskStatus};

/// The complete in-memory record for a single submitted task.
///
/// Only the [`TaskRegistry`] holds the authoritative copy. Everything handed
/// out by the registry is a snapshot; mutation goes through
/// [`TaskRegistry::update`] and the transition methods below, which keep the
/// record's invariants (an artifact reference exists exactly when the task is
/// `Completed`, an error exactly when it is `Failed`).
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Percentage, 0..=100. Never decreases while processing.
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub request: Arc<GenerationRequest>,
    pub output_path: Option<PathBuf>,
    pub output_size: Option<u64>,
    pub output_format: Option<AudioFormat>,
    pub error: Option<RuntimeError>,
}

impl TaskRecord {
    fn new(id: TaskId, request: Arc<GenerationRequest>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Accepted,
            progress: 0,
            message: "Task accepted".to_owned(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            request,
            output_path: None,
            output_size: None,
            output_format: None,
            error: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), RuntimeError> {
        self.status.validate_transition(self.id, next)?;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `Accepted -> Queued`.
    pub fn mark_queued(&mut self, position: usize) -> Result<(), RuntimeError> {
        self.transition(TaskStatus::Queued)?;
        self.message = format!("Waiting for a free GPU slot (position {position})");
        Ok(())
    }

    /// `Accepted | Queued -> Processing`.
    pub fn start_processing(&mut self) -> Result<(), RuntimeError> {
        self.transition(TaskStatus::Processing)?;
        self.progress = 0;
        self.started_at = Some(self.updated_at);
        self.message = "Generation started".to_owned();
        Ok(())
    }

    /// Record a progress hint. Lower percentages than the current one only
    /// update the message. Values above 99 are held back until completion.
    pub fn report_progress(
        &mut self,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), RuntimeError> {
        if self.status != TaskStatus::Processing {
            return Err(RuntimeError::NotReady {
                task_id: self.id,
                status: self.status,
            });
        }
        self.progress = self.progress.max(percent.min(99));
        if let Some(message) = message {
            self.message = message;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `Processing -> Completed`, attaching the artifact in the same step.
    pub fn complete(&mut self, artifact: &StoredArtifact) -> Result<(), RuntimeError> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 100;
        self.message = "Generation completed successfully".to_owned();
        self.output_path = Some(artifact.path.clone());
        self.output_size = Some(artifact.size);
        self.output_format = Some(artifact.format);
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// `* -> Failed`, recording the error in the same step. Progress is frozen.
    pub fn fail(&mut self, error: RuntimeError) -> Result<(), RuntimeError> {
        self.transition(TaskStatus::Failed)?;
        self.message = format!("Generation failed: {error}");
        self.error = Some(error);
        self.finished_at = Some(self.updated_at);
        Ok(())
    }
}

/// A read-only view of a task's current state returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            status: record.status,
            progress: record.progress,
            message: record.message.clone(),
            created_at: record.created_at,
            output_path: record.output_path.clone(),
            output_size: record.output_size,
            error: record.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub accepted: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct Entry {
    record: TaskRecord,
    status_tx: watch::Sender<TaskStatus>,
}

/// Centralized, thread-safe registry of every known task.
///
/// Uses a `tokio::sync::RwLock<HashMap>` so many readers can observe task
/// status concurrently while updates are applied one at a time. Each entry
/// also carries a `watch` channel so callers can await status changes.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<TaskId, Entry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and insert an `Accepted` record.
    pub async fn create(&self, request: Arc<GenerationRequest>) -> TaskId {
        let mut guard = self.inner.write().await;
        let mut task_id = TaskId::new();
        while guard.contains_key(&task_id) {
            task_id = TaskId::new();
        }
        let record = TaskRecord::new(task_id, request);
        let (status_tx, _) = watch::channel(record.status);
        guard.insert(task_id, Entry { record, status_tx });
        task_id
    }

    /// Snapshot of the full record.
    pub async fn get(&self, task_id: TaskId) -> Result<TaskRecord, RuntimeError> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .map(|e| e.record.clone())
            .ok_or(RuntimeError::TaskNotFound { task_id })
    }

    /// Client-facing projection of the record.
    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatusView, RuntimeError> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .map(|e| TaskStatusView::from(&e.record))
            .ok_or(RuntimeError::TaskNotFound { task_id })
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `mutate` runs against a copy while the write lock is held; the copy is
    /// committed only if `mutate` returns `Ok`, so a rejected transition
    /// leaves the record untouched.
    pub async fn update<R>(
        &self,
        task_id: TaskId,
        mutate: impl FnOnce(&mut TaskRecord) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let mut guard = self.inner.write().await;
        let entry = guard
            .get_mut(&task_id)
            .ok_or(RuntimeError::TaskNotFound { task_id })?;

        let mut draft = entry.record.clone();
        let out = mutate(&mut draft)?;
        let status_changed = draft.status != entry.record.status;
        entry.record = draft;
        if status_changed {
            entry.status_tx.send_replace(entry.record.status);
        }
        Ok(out)
    }

    /// Remove a record. Dropping its entry closes the status channel.
    pub async fn remove(&self, task_id: TaskId) -> Result<TaskRecord, RuntimeError> {
        self.inner
            .write()
            .await
            .remove(&task_id)
            .map(|e| e.record)
            .ok_or(RuntimeError::TaskNotFound { task_id })
    }

    /// Watch a task's status. The channel closes when the record is removed.
    pub async fn subscribe(
        &self,
        task_id: TaskId,
    ) -> Result<watch::Receiver<TaskStatus>, RuntimeError> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .map(|e| e.status_tx.subscribe())
            .ok_or(RuntimeError::TaskNotFound { task_id })
    }

    /// Snapshot of every record.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        self.inner
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub async fn counts(&self) -> StatusCounts {
        let guard = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for entry in guard.values() {
            match entry.record.status {
                TaskStatus::Accepted => counts.accepted += 1,
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Arc<GenerationRequest> {
        Arc::new(GenerationRequest::new("[00:01.00]la", "lofi"))
    }

    fn artifact() -> StoredArtifact {
        StoredArtifact {
            path: PathBuf::from("/tmp/out/generated.wav"),
            size: 44,
            format: AudioFormat::Wav,
        }
    }

    #[tokio::test]
    async fn create_starts_accepted_with_zero_progress() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;
        let view = registry.status(id).await.expect("task exists");
        assert_eq!(view.status, TaskStatus::Accepted);
        assert_eq!(view.progress, 0);
        assert!(view.output_path.is_none());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = TaskRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(registry.create(request()).await));
        }
        assert_eq!(registry.len().await, 64);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = TaskRegistry::new();
        let missing = TaskId::new();
        assert_eq!(
            registry.get(missing).await.unwrap_err(),
            RuntimeError::TaskNotFound { task_id: missing }
        );
        assert!(registry.update(missing, |_| Ok(())).await.is_err());
        assert!(registry.remove(missing).await.is_err());
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_record_untouched() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;

        let err = registry
            .update(id, |t| {
                t.message = "scribbled".into();
                t.complete(&artifact())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTransition { .. }));

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Accepted);
        assert_eq!(record.message, "Task accepted");
    }

    #[tokio::test]
    async fn completion_sets_artifact_atomically() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;
        registry.update(id, |t| t.start_processing()).await.unwrap();
        registry
            .update(id, |t| t.report_progress(40, Some("half way".into())))
            .await
            .unwrap();
        registry.update(id, |t| t.complete(&artifact())).await.unwrap();

        let view = registry.status(id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(view.output_size, Some(44));
        assert!(view.output_path.is_some());
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;
        registry.update(id, |t| t.start_processing()).await.unwrap();
        registry.update(id, |t| t.report_progress(60, None)).await.unwrap();
        registry
            .update(id, |t| t.report_progress(20, Some("decoding".into())))
            .await
            .unwrap();
        registry.update(id, |t| t.report_progress(100, None)).await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.progress, 99);
        assert_eq!(record.message, "decoding");
    }

    #[tokio::test]
    async fn failure_freezes_progress_and_is_terminal() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;
        registry.update(id, |t| t.start_processing()).await.unwrap();
        registry.update(id, |t| t.report_progress(30, None)).await.unwrap();
        registry
            .update(id, |t| {
                t.fail(RuntimeError::Inference {
                    message: "boom".into(),
                })
            })
            .await
            .unwrap();

        assert!(registry.update(id, |t| t.report_progress(50, None)).await.is_err());
        assert!(registry.update(id, |t| t.complete(&artifact())).await.is_err());

        let view = registry.status(id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.progress, 30);
        assert!(view.error.unwrap().contains("boom"));
        assert!(view.output_path.is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_status_changes_and_removal() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;
        let mut rx = registry.subscribe(id).await.unwrap();
        assert_eq!(*rx.borrow(), TaskStatus::Accepted);

        registry.update(id, |t| t.start_processing()).await.unwrap();
        rx.changed().await.expect("status changed");
        assert_eq!(*rx.borrow_and_update(), TaskStatus::Processing);

        registry.remove(id).await.unwrap();
        assert!(rx.changed().await.is_err(), "channel closes on removal");
    }

    #[tokio::test]
    async fn counts_group_by_status() {
        let registry = TaskRegistry::new();
        let a = registry.create(request()).await;
        let b = registry.create(request()).await;
        let _c = registry.create(request()).await;
        registry.update(a, |t| t.start_processing()).await.unwrap();
        registry.update(b, |t| t.mark_queued(1)).await.unwrap();

        let counts = registry.counts().await;
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.accepted, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let registry = TaskRegistry::new();
        let id = registry.create(request()).await;
        registry.update(id, |t| t.start_processing()).await.unwrap();

        let mut handles = Vec::new();
        for pct in 1..=50u8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.update(id, |t| t.report_progress(pct, None)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(registry.get(id).await.unwrap().progress, 50);
    }
}
