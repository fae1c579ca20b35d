//! Inference backends
//!
//! A backend is the opaque engine that actually loads weights and produces
//! completions. It lives inside a worker thread and is only reached through
//! the worker channel.

pub mod openai;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::inference::state::ProgressReport;
use crate::inference::worker::LoadEvent;
use crate::types::message::{ChatCompletion, Message};
use crate::types::model::{ModelConfig, ModelDescriptor};

/// Backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Model not available: {0}")]
    ModelUnavailable(String),
    #[error("No model loaded")]
    NotLoaded,
    #[error("{0}")]
    Other(String),
}

/// Inference engine hosted by a worker thread
#[async_trait]
pub trait InferenceBackend: Send {
    /// Load a model, reporting progress as it goes
    async fn load(
        &mut self,
        model: &ModelDescriptor,
        config: &ModelConfig,
        progress: &ProgressSink,
    ) -> Result<(), BackendError>;

    /// Produce a completion for the given prompt context
    async fn complete(&mut self, messages: Vec<Message>) -> Result<ChatCompletion, BackendError>;
}

/// Creates one backend per worker, on the worker thread
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn InferenceBackend>, BackendError>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<Box<dyn InferenceBackend>, BackendError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn InferenceBackend>, BackendError> {
        self()
    }
}

/// Forwards load progress from the backend to whoever requested the load
#[derive(Debug, Clone)]
pub struct ProgressSink {
    events: mpsc::UnboundedSender<LoadEvent>,
}

impl ProgressSink {
    pub(crate) fn new(events: mpsc::UnboundedSender<LoadEvent>) -> Self {
        Self { events }
    }

    pub fn report(&self, report: ProgressReport) {
        // Requester gone means the load was abandoned
        let _ = self.events.send(LoadEvent::Progress(report));
    }

    pub fn step(&self, progress: f64, text: impl Into<String>) {
        self.report(ProgressReport::new(progress, text));
    }
}
