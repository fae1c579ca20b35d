//! Engine handle
//!
//! An engine handle binds one worker to one loaded model and exposes the
//! single completion operation. Discarding the handle terminates its worker.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::inference::state::ProgressReport;
use crate::inference::worker::{LoadEvent, WorkerChannel, WorkerRequest, WorkerSpawnError};
use crate::types::message::{ChatCompletion, Message};
use crate::types::model::{ModelConfig, ModelDescriptor};

/// Errors raised while creating an engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error(transparent)]
    Spawn(#[from] WorkerSpawnError),
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Worker stopped before the model finished loading")]
    WorkerGone,
    #[error("Model load cancelled")]
    Cancelled,
}

/// Errors raised by a single completion call
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion failed: {0}")]
    Engine(String),
    #[error("Engine returned no choices")]
    EmptyResponse,
    #[error("Engine was discarded while the request was in flight")]
    EngineDiscarded,
    #[error("Completion cancelled")]
    Cancelled,
}

/// Live engine bound to exactly one model
#[derive(Debug)]
pub struct EngineHandle {
    model: ModelDescriptor,
    worker: WorkerChannel,
}

impl EngineHandle {
    /// Load `model` inside `worker`, forwarding progress to `on_progress`.
    ///
    /// On any error the worker is dropped, which terminates it.
    pub async fn create<F>(
        worker: WorkerChannel,
        model: ModelDescriptor,
        config: ModelConfig,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<Self, EngineError>
    where
        F: FnMut(ProgressReport),
    {
        let (events, mut inbox) = mpsc::unbounded_channel();
        worker
            .post(WorkerRequest::Load {
                model: model.clone(),
                config,
                events,
            })
            .map_err(|_| EngineError::WorkerGone)?;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                event = inbox.recv() => event,
            };

            match event {
                Some(LoadEvent::Progress(report)) => on_progress(report),
                Some(LoadEvent::Finished(Ok(()))) => return Ok(Self { model, worker }),
                Some(LoadEvent::Finished(Err(reason))) => return Err(EngineError::Load(reason)),
                None => return Err(EngineError::WorkerGone),
            }
        }
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn worker_id(&self) -> u64 {
        self.worker.id()
    }

    /// Run one completion over `messages`
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, CompletionError> {
        let (reply, answer) = oneshot::channel();
        let request_cancel = cancel.child_token();
        self.worker
            .post(WorkerRequest::Complete {
                messages,
                cancel: request_cancel.clone(),
                reply,
            })
            .map_err(|_| CompletionError::EngineDiscarded)?;

        let discarded = self.worker.shutdown_token();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
            _ = discarded.cancelled() => Err(CompletionError::EngineDiscarded),
            answer = answer => match answer {
                Ok(Ok(completion)) => Ok(completion),
                Ok(Err(reason)) => Err(CompletionError::Engine(reason)),
                Err(_) => Err(CompletionError::EngineDiscarded),
            },
        };

        // Stop the worker from finishing a request nobody waits for
        request_cancel.cancel();
        result
    }

    /// Terminate the worker; in-flight and future calls fail
    pub fn discard(&self) {
        self.worker.terminate();
    }

    pub fn is_discarded(&self) -> bool {
        self.worker.is_terminated()
    }
}
