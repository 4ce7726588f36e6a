use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::catalog::{self, ModelInfo};
use crate::config::{CleanupPolicy, Config};
use crate::request::GenerationRequest;
use crate::runtime::artifact::{ArtifactStore, AudioFormat};
use crate::runtime::backend::{Admission, AdmissionGate, GateStats, InferenceBackend};
use crate::runtime::registry::{StatusCounts, TaskRegistry, TaskStatusView};
use crate::runtime::retention;
use crate::runtime::types::{RuntimeError, TaskId, TaskStatus};
use crate::runtime::worker::{worker_panicked, GenerationWorker};

/// Commands sent to the orchestrator's internal event loop.
#[derive(Debug)]
enum OrchestratorCommand {
    /// Run an admitted task in the background.
    Spawn {
        task_id: TaskId,
        request: Arc<GenerationRequest>,
        admission: Admission,
    },
    /// Abort in-flight workers and stop the loop.
    Shutdown { done: oneshot::Sender<()> },
}

/// Result of a successful [`Orchestrator::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub task_id: TaskId,
    /// `processing` when a slot was free, otherwise `queued`.
    pub status: TaskStatus,
    /// 1-based queue position when queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// A downloaded artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub task_id: TaskId,
    pub bytes: Bytes,
    pub format: AudioFormat,
    /// Suggested attachment name, `generated_music_<task_id>.<ext>`.
    pub file_name: String,
}

impl Artifact {
    fn new(task_id: TaskId, bytes: Bytes, format: AudioFormat) -> Self {
        Self {
            task_id,
            bytes,
            format,
            file_name: format!("generated_music_{task_id}.{}", format.extension()),
        }
    }
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct Generated {
    pub task_id: TaskId,
    pub bytes: Bytes,
    pub format: AudioFormat,
    pub size: u64,
    /// Time from submission to the terminal state.
    pub elapsed: Duration,
}

/// Point-in-time load figures for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub gate: GateStats,
    pub counts: StatusCounts,
}

/// The runtime orchestrator.
///
/// Validates submissions, registers tasks, asks the [`AdmissionGate`] for a
/// slot, and hands every task to a background worker. All public operations
/// return promptly; generation itself happens off the caller's path.
///
/// # Usage
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::start(Config::default(), backend).await?;
/// let submission = orchestrator.submit(request).await?;
/// let view = orchestrator.get_status(submission.task_id).await?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    registry: TaskRegistry,
    gate: AdmissionGate,
    artifacts: ArtifactStore,
    config: Arc<Config>,
    command_tx: mpsc::UnboundedSender<OrchestratorCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("gate", &self.gate)
            .field("artifacts", &self.artifacts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start the orchestrator.
    ///
    /// Opens the artifact store, spawns the dispatch loop and, if configured,
    /// the retention sweeper.
    pub async fn start(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, RuntimeError> {
        let artifacts = ArtifactStore::open(&config.output_dir).await?;
        let registry = TaskRegistry::new();
        let gate = AdmissionGate::new(config.gpu_slots);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = GenerationWorker {
            registry: registry.clone(),
            artifacts: artifacts.clone(),
            backend,
            timeout: config.task_timeout,
            progress_step: config.progress_step,
        };
        tokio::spawn(Self::run_loop(command_rx, worker));

        let retention = config.retention;
        let orchestrator = Self {
            registry,
            gate,
            artifacts,
            config: Arc::new(config),
            command_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        };
        if let Some(policy) = retention {
            retention::spawn_sweeper(orchestrator.clone(), policy, shutdown_rx);
        }

        info!(
            gpu_slots = orchestrator.gate.capacity(),
            output_dir = %orchestrator.artifacts.root().display(),
            timeout_secs = orchestrator.config.task_timeout.as_secs(),
            "orchestrator started"
        );
        Ok(orchestrator)
    }

    /// Internal event loop: spawns workers and supervises their outcome.
    async fn run_loop(
        mut rx: mpsc::UnboundedReceiver<OrchestratorCommand>,
        worker: GenerationWorker,
    ) {
        let mut workers = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskId> = HashMap::new();

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(OrchestratorCommand::Spawn { task_id, request, admission }) => {
                        let task_worker = worker.clone();
                        let handle = workers.spawn(async move {
                            task_worker.execute(task_id, request, admission).await;
                        });
                        running.insert(handle.id(), task_id);
                    }
                    Some(OrchestratorCommand::Shutdown { done }) => {
                        if !workers.is_empty() {
                            warn!(in_flight = workers.len(), "aborting in-flight generations");
                        }
                        workers.abort_all();
                        while let Some(joined) = workers.join_next_with_id().await {
                            Self::reap(&worker, &mut running, joined).await;
                        }
                        rx.close();
                        while let Ok(cmd) = rx.try_recv() {
                            if let OrchestratorCommand::Spawn { task_id, .. } = cmd {
                                worker.fail(task_id, RuntimeError::Shutdown).await;
                            }
                        }
                        let _ = done.send(());
                        return;
                    }
                    None => break,
                },
                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    Self::reap(&worker, &mut running, joined).await;
                }
            }
        }

        while let Some(joined) = workers.join_next_with_id().await {
            Self::reap(&worker, &mut running, joined).await;
        }
    }

    /// Record the outcome of a finished worker that did not reach a terminal
    /// state by itself.
    async fn reap(
        worker: &GenerationWorker,
        running: &mut HashMap<tokio::task::Id, TaskId>,
        joined: Result<(tokio::task::Id, ()), JoinError>,
    ) {
        let err = match joined {
            Ok((id, ())) => {
                running.remove(&id);
                return;
            }
            Err(err) => err,
        };
        let Some(task_id) = running.remove(&err.id()) else {
            return;
        };
        if err.is_panic() {
            error!(%task_id, "generation worker panicked");
            worker.fail(task_id, worker_panicked()).await;
        } else {
            worker.fail(task_id, RuntimeError::Shutdown).await;
        }
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Validate and register a generation request.
    ///
    /// Returns as soon as the task has a slot or a place in the queue; the
    /// returned status is `processing` or `queued` accordingly. Invalid
    /// requests are rejected with [`RuntimeError::Validation`] and leave no
    /// record behind.
    pub async fn submit(&self, request: GenerationRequest) -> Result<Submission, RuntimeError> {
        request.check(self.config.max_batch)?;
        let request = Arc::new(request);
        let task_id = self.registry.create(Arc::clone(&request)).await;

        let admission = match self.gate.admit(task_id) {
            Ok(admission) => admission,
            Err(err) => {
                let _ = self.registry.remove(task_id).await;
                return Err(err);
            }
        };
        let (status, position) = match &admission {
            Admission::Granted(_) => {
                self.registry
                    .update(task_id, |t| t.start_processing())
                    .await?;
                (TaskStatus::Processing, None)
            }
            Admission::Queued { position, .. } => {
                let position = *position;
                self.registry
                    .update(task_id, |t| t.mark_queued(position))
                    .await?;
                (TaskStatus::Queued, Some(position))
            }
        };

        let spawn = OrchestratorCommand::Spawn {
            task_id,
            request: Arc::clone(&request),
            admission,
        };
        if self.command_tx.send(spawn).is_err() {
            let _ = self
                .registry
                .update(task_id, |t| t.fail(RuntimeError::Shutdown))
                .await;
            return Err(RuntimeError::Shutdown);
        }

        info!(
            %task_id,
            %status,
            model = %request.model_id,
            audio_length = request.audio_length.seconds(),
            batch = request.batch_count,
            "generation task submitted"
        );
        Ok(Submission {
            task_id,
            status,
            position,
        })
    }

    /// Return a snapshot of the task's current status.
    pub async fn get_status(&self, task_id: TaskId) -> Result<TaskStatusView, RuntimeError> {
        self.registry.status(task_id).await
    }

    /// Read the artifact of a completed task.
    ///
    /// Fails with [`RuntimeError::NotReady`] while the task is still running
    /// and with [`RuntimeError::ArtifactNotFound`] if it failed or the file
    /// is gone.
    pub async fn download(&self, task_id: TaskId) -> Result<Artifact, RuntimeError> {
        let record = self.registry.get(task_id).await?;
        if record.status == TaskStatus::Failed {
            return Err(RuntimeError::ArtifactNotFound { task_id });
        }
        if record.status != TaskStatus::Completed {
            return Err(RuntimeError::NotReady {
                task_id,
                status: record.status,
            });
        }
        let (Some(path), Some(format)) = (record.output_path, record.output_format) else {
            return Err(RuntimeError::ArtifactNotFound { task_id });
        };
        let bytes = self
            .artifacts
            .read(&path)
            .await?
            .ok_or(RuntimeError::ArtifactNotFound { task_id })?;

        if self.config.cleanup == CleanupPolicy::DeleteAfterDownload {
            self.evict(task_id).await?;
        }
        Ok(Artifact::new(task_id, bytes, format))
    }

    /// Delete a finished task's artifact and forget the task.
    ///
    /// Tasks that are still `accepted`, `queued` or `processing` are refused
    /// with [`RuntimeError::NotReady`].
    pub async fn cleanup(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        let record = self.registry.get(task_id).await?;
        if !record.status.is_terminal() {
            return Err(RuntimeError::NotReady {
                task_id,
                status: record.status,
            });
        }
        self.evict(task_id).await?;
        info!(%task_id, "task cleaned up");
        Ok(())
    }

    /// Remove every terminal task that finished more than `max_age` ago.
    /// Returns the number of tasks removed.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<TaskId> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|t| t.status.is_terminal())
            .filter(|t| {
                t.finished_at
                    .and_then(|at| (now - at).to_std().ok())
                    .is_some_and(|age| age >= max_age)
            })
            .map(|t| t.id)
            .collect();

        let mut removed = 0;
        for task_id in expired {
            match self.evict(task_id).await {
                Ok(()) => removed += 1,
                Err(RuntimeError::TaskNotFound { .. }) => {}
                Err(err) => warn!(%task_id, error = %err, "failed to expire task"),
            }
        }
        removed
    }

    /// Submit and wait up to `wait` for the task to finish.
    ///
    /// On success the artifact is returned and the task is forgotten. A
    /// failed task yields its recorded error. If the wait elapses or the
    /// returned future is dropped, the task keeps running and is evicted as
    /// soon as it reaches a terminal state.
    pub async fn run(
        &self,
        request: GenerationRequest,
        wait: Duration,
    ) -> Result<Generated, RuntimeError> {
        let started = Instant::now();
        let task_id = self.submit(request).await?.task_id;
        let guard = AbandonGuard::new(self.clone(), task_id);
        let mut status_rx = self.registry.subscribe(task_id).await?;

        let finished = tokio::time::timeout(wait, async {
            status_rx
                .wait_for(|status| status.is_terminal())
                .await
                .map(|_| ())
        })
        .await;
        match finished {
            Err(_) => {
                warn!(%task_id, wait_ms = wait.as_millis() as u64, "synchronous generation timed out");
                return Err(RuntimeError::Timeout { budget: wait });
            }
            Ok(Err(_)) => return Err(RuntimeError::TaskNotFound { task_id }),
            Ok(Ok(())) => {}
        }

        let record = self.registry.get(task_id).await?;
        if record.status == TaskStatus::Failed {
            let err = record.error.unwrap_or(RuntimeError::Inference {
                message: "generation failed".to_owned(),
            });
            let _ = self.evict(task_id).await;
            guard.disarm();
            return Err(err);
        }

        let artifact = self.download(task_id).await?;
        if self.config.cleanup == CleanupPolicy::Retain {
            let _ = self.evict(task_id).await;
        }
        guard.disarm();
        Ok(Generated {
            task_id,
            size: artifact.bytes.len() as u64,
            bytes: artifact.bytes,
            format: artifact.format,
            elapsed: started.elapsed(),
        })
    }

    /// The static model catalog.
    pub fn list_capabilities(&self) -> &'static [ModelInfo] {
        catalog::models()
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            gate: self.gate.stats(),
            counts: self.registry.counts().await,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop accepting work, fail queued and in-flight tasks with
    /// [`RuntimeError::Shutdown`], and wait for the workers to wind down.
    pub async fn shutdown(&self) {
        self.gate.close();
        let _ = self.shutdown_tx.send(true);
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(OrchestratorCommand::Shutdown { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        info!("orchestrator stopped");
    }

    async fn evict(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        if let Err(err) = self.artifacts.delete_task(task_id).await {
            warn!(%task_id, error = %err, "failed to delete task artifacts");
        }
        self.registry.remove(task_id).await.map(|_| ())
    }

    /// Wait for `task_id` to finish, then evict it. Returns quietly if the
    /// task is removed by someone else first.
    async fn evict_when_finished(&self, task_id: TaskId) {
        let Ok(mut status_rx) = self.registry.subscribe(task_id).await else {
            return;
        };
        let finished = status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|_| ());
        if finished.is_err() {
            return;
        }
        if self.evict(task_id).await.is_ok() {
            info!(%task_id, "abandoned synchronous task evicted");
        }
    }
}

/// Hands a task started by [`Orchestrator::run`] back to the orchestrator
/// unless `run` collected its outcome.
struct AbandonGuard {
    orchestrator: Option<Orchestrator>,
    task_id: TaskId,
}

impl AbandonGuard {
    fn new(orchestrator: Orchestrator, task_id: TaskId) -> Self {
        Self {
            orchestrator: Some(orchestrator),
            task_id,
        }
    }

    fn disarm(mut self) {
        self.orchestrator = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(orchestrator) = self.orchestrator.take() else {
            return;
        };
        let task_id = self.task_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { orchestrator.evict_when_finished(task_id).await });
            }
            Err(_) => warn!(%task_id, "no runtime to evict abandoned task"),
        }
    }
}
