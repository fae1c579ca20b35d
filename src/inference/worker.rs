//! Worker channel
//!
//! Message-passing boundary between the interactive runtime and a dedicated
//! background thread hosting an inference backend. Each worker owns one OS
//! thread running a single-threaded tokio runtime; requests are handled one
//! at a time in the order they were posted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::inference::backend::{BackendFactory, InferenceBackend, ProgressSink};
use crate::inference::state::ProgressReport;
use crate::types::message::{ChatCompletion, Message};
use crate::types::model::{ModelConfig, ModelDescriptor};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// The host could not create a background context
#[derive(Debug, Error)]
pub enum WorkerSpawnError {
    #[error("Failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("Failed to spawn worker thread: {0}")]
    Thread(#[source] std::io::Error),
    #[error("Worker creation refused: {0}")]
    Refused(String),
}

/// The worker has stopped and no longer accepts requests
#[derive(Debug, Error)]
#[error("Worker {0} is no longer running")]
pub struct WorkerGone(pub u64);

/// Events produced while a model loads
#[derive(Debug)]
pub enum LoadEvent {
    Progress(ProgressReport),
    Finished(Result<(), String>),
}

/// Requests accepted by a worker
#[derive(Debug)]
pub enum WorkerRequest {
    Load {
        model: ModelDescriptor,
        config: ModelConfig,
        events: mpsc::UnboundedSender<LoadEvent>,
    },
    Complete {
        messages: Vec<Message>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<ChatCompletion, String>>,
    },
}

/// Host capability for creating background contexts
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerChannel, WorkerSpawnError>;
}

/// Handle to one background worker
///
/// Dropping the channel terminates the worker.
#[derive(Debug)]
pub struct WorkerChannel {
    id: u64,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    shutdown: CancellationToken,
}

impl WorkerChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a request; fails once the worker has stopped
    pub fn post(&self, request: WorkerRequest) -> Result<(), WorkerGone> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerGone(self.id));
        }
        self.requests.send(request).map_err(|_| WorkerGone(self.id))
    }

    /// Stop the worker. Whatever it is doing is abandoned at its next await point.
    pub fn terminate(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(worker = self.id, "Terminating inference worker");
            self.shutdown.cancel();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when the worker terminates
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawns one OS thread per worker, each with its own backend
#[derive(Clone)]
pub struct ThreadSpawner {
    factory: Arc<dyn BackendFactory>,
}

impl ThreadSpawner {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self { factory }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self) -> Result<WorkerChannel, WorkerSpawnError> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerSpawnError::Runtime)?;

        let (requests, inbox) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let factory = self.factory.clone();
        let worker_shutdown = shutdown.clone();

        std::thread::Builder::new()
            .name(format!("inference-worker-{id}"))
            .spawn(move || {
                runtime.block_on(run_worker(id, factory, inbox, worker_shutdown));
            })
            .map_err(WorkerSpawnError::Thread)?;

        tracing::debug!(worker = id, "Spawned inference worker");
        Ok(WorkerChannel {
            id,
            requests,
            shutdown,
        })
    }
}

async fn run_worker(
    id: u64,
    factory: Arc<dyn BackendFactory>,
    mut inbox: mpsc::UnboundedReceiver<WorkerRequest>,
    shutdown: CancellationToken,
) {
    let mut backend: Result<Box<dyn InferenceBackend>, String> =
        factory.create().map_err(|e| e.to_string());
    if let Err(e) = &backend {
        tracing::error!(worker = id, "Failed to create backend: {}", e);
    }

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = inbox.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let backend = match backend.as_mut() {
            Ok(backend) => backend,
            Err(reason) => {
                reject(request, reason.clone());
                continue;
            }
        };

        match request {
            WorkerRequest::Load {
                model,
                config,
                events,
            } => {
                let sink = ProgressSink::new(events.clone());
                let result = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    result = backend.load(&model, &config, &sink) => result,
                };
                let _ = events.send(LoadEvent::Finished(result.map_err(|e| e.to_string())));
            }
            WorkerRequest::Complete {
                messages,
                cancel,
                reply,
            } => {
                let result = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = cancel.cancelled() => continue,
                    result = backend.complete(messages) => result,
                };
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
        }
    }

    tracing::debug!(worker = id, "Inference worker stopped");
}

fn reject(request: WorkerRequest, reason: String) {
    match request {
        WorkerRequest::Load { events, .. } => {
            let _ = events.send(LoadEvent::Finished(Err(reason)));
        }
        WorkerRequest::Complete { reply, .. } => {
            let _ = reply.send(Err(reason));
        }
    }
}
