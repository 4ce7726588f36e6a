use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::request::GenerationRequest;
use crate::runtime::artifact::ArtifactStore;
use crate::runtime::backend::{
    Admission, GenerationJob, InferenceBackend, ProgressEvent, ProgressSink,
};
use crate::runtime::registry::TaskRegistry;
use crate::runtime::types::{RuntimeError, TaskId};

const PROGRESS_BUFFER: usize = 64;

/// Runs exactly one task from admission to a terminal state.
///
/// The worker is the only writer of a task's record between admission and
/// completion. It holds the compute permit for the whole run and releases it
/// only after the terminal state is recorded, so with a single slot two tasks
/// are never `processing` at the same time.
#[derive(Clone)]
pub(crate) struct GenerationWorker {
    pub(crate) registry: TaskRegistry,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) backend: Arc<dyn InferenceBackend>,
    pub(crate) timeout: Duration,
    pub(crate) progress_step: u8,
}

impl GenerationWorker {
    /// Wait for a slot if needed, run the backend, and record the outcome.
    pub(crate) async fn execute(
        &self,
        task_id: TaskId,
        request: Arc<GenerationRequest>,
        admission: Admission,
    ) {
        let permit = match admission {
            // The submitter already moved the record to `processing`.
            Admission::Granted(permit) => permit,
            Admission::Queued { ticket, .. } => {
                let permit = match ticket.wait().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        self.fail(task_id, err).await;
                        return;
                    }
                };
                if let Err(err) = self.registry.update(task_id, |t| t.start_processing()).await {
                    warn!(%task_id, error = %err, "could not promote queued task");
                    return;
                }
                info!(%task_id, "task promoted from queue");
                permit
            }
        };

        let outcome = AssertUnwindSafe(self.generate(task_id, request))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.fail(task_id, err).await,
            Err(_) => self.fail(task_id, worker_panicked()).await,
        }
        drop(permit);
    }

    async fn generate(
        &self,
        task_id: TaskId,
        request: Arc<GenerationRequest>,
    ) -> Result<(), RuntimeError> {
        let work_dir = self.artifacts.work_dir(task_id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| RuntimeError::storage(format!("create {}", work_dir.display()), e))?;
        let job = GenerationJob {
            task_id,
            request,
            work_dir,
        };

        let (sink, events) = ProgressSink::channel(PROGRESS_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let started = std::time::Instant::now();
        let run = async {
            let result = tokio::time::timeout(self.timeout, self.backend.generate(&job, sink)).await;
            let _ = stop_tx.send(());
            result
        };
        let (result, ()) = tokio::join!(run, self.relay_progress(task_id, events, stop_rx));
        self.artifacts.discard_work_dir(task_id).await;

        let audio = match result {
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    budget: self.timeout,
                })
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(audio)) => audio,
        };
        if audio.bytes.is_empty() {
            return Err(RuntimeError::Inference {
                message: "inference produced no audio".to_owned(),
            });
        }

        let stored = self.artifacts.save(task_id, &audio.bytes).await?;
        if let Err(err) = self.registry.update(task_id, |t| t.complete(&stored)).await {
            if let Err(e) = self.artifacts.delete(&stored.path).await {
                warn!(%task_id, error = %e, "failed to remove orphaned artifact");
            }
            return Err(err);
        }
        info!(
            %task_id,
            size = stored.size,
            format = stored.format.extension(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation completed"
        );
        Ok(())
    }

    /// Forward backend progress to the registry until `stop` fires, then
    /// drain whatever is still buffered.
    async fn relay_progress(
        &self,
        task_id: TaskId,
        mut events: mpsc::Receiver<ProgressEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut last_percent = 0u8;
        let mut last_message: Option<String> = None;
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => {
                        self.apply_progress(task_id, event, &mut last_percent, &mut last_message)
                            .await;
                    }
                    None => break,
                },
                _ = &mut stop => {
                    while let Ok(event) = events.try_recv() {
                        self.apply_progress(task_id, event, &mut last_percent, &mut last_message)
                            .await;
                    }
                    break;
                }
            }
        }
    }

    async fn apply_progress(
        &self,
        task_id: TaskId,
        event: ProgressEvent,
        last_percent: &mut u8,
        last_message: &mut Option<String>,
    ) {
        let percent = event.percent();
        let message = event.message().map(str::to_owned);
        let advanced = percent >= last_percent.saturating_add(self.progress_step.max(1));
        let relabelled = message.is_some() && message != *last_message;
        if !advanced && !relabelled {
            return;
        }

        let update = message.clone();
        match self
            .registry
            .update(task_id, |t| t.report_progress(percent, update))
            .await
        {
            Ok(()) => {
                *last_percent = (*last_percent).max(percent);
                if message.is_some() {
                    *last_message = message;
                }
            }
            Err(err) => debug!(%task_id, error = %err, "progress update dropped"),
        }
    }

    pub(crate) async fn fail(&self, task_id: TaskId, error: RuntimeError) {
        warn!(%task_id, kind = error.kind(), error = %error, "generation failed");
        if let Err(err) = self.registry.update(task_id, |t| t.fail(error)).await {
            warn!(%task_id, error = %err, "could not record failure");
        }
    }
}

pub(crate) fn worker_panicked() -> RuntimeError {
    RuntimeError::Inference {
        message: "worker panicked".to_owned(),
    }
}
