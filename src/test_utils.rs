//! Test doubles for the worker and backend layers.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::inference::backend::{BackendError, BackendFactory, InferenceBackend, ProgressSink};
use crate::inference::worker::{ThreadSpawner, WorkerChannel, WorkerSpawnError, WorkerSpawner};
use crate::types::message::{ChatCompletion, Message};
use crate::types::model::{ModelConfig, ModelDescriptor};

/// Fail the test instead of hanging
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for future")
}

struct ScriptState {
    progress: Mutex<Vec<(f64, String)>>,
    load_error: Mutex<Option<String>>,
    replies: Mutex<VecDeque<Result<ChatCompletion, String>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    load_open: watch::Sender<bool>,
    completion_open: watch::Sender<bool>,
    loads_started: watch::Sender<usize>,
}

/// Shared script driving every [`ScriptedBackend`] a spawner creates
#[derive(Clone)]
pub(crate) struct Script {
    state: Arc<ScriptState>,
}

impl Script {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(ScriptState {
                progress: Mutex::new(Vec::new()),
                load_error: Mutex::new(None),
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                load_open: watch::channel(true).0,
                completion_open: watch::channel(true).0,
                loads_started: watch::channel(0).0,
            }),
        }
    }

    pub(crate) fn with_progress(self, steps: &[(f64, &str)]) -> Self {
        *self.state.progress.lock().unwrap() =
            steps.iter().map(|(p, t)| (*p, t.to_string())).collect();
        self
    }

    pub(crate) fn with_reply(self, reply: Result<ChatCompletion, String>) -> Self {
        self.state.replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn fail_load(self, reason: &str) -> Self {
        *self.state.load_error.lock().unwrap() = Some(reason.to_string());
        self
    }

    pub(crate) fn gate_loads(self) -> Self {
        self.close_load_gate();
        self
    }

    pub(crate) fn gate_completions(self) -> Self {
        self.state.completion_open.send_replace(false);
        self
    }

    pub(crate) fn close_load_gate(&self) {
        self.state.load_open.send_replace(false);
    }

    pub(crate) fn release_load(&self) {
        self.state.load_open.send_replace(true);
    }

    pub(crate) fn release_completions(&self) {
        self.state.completion_open.send_replace(true);
    }

    pub(crate) fn clear_load_failure(&self) {
        *self.state.load_error.lock().unwrap() = None;
    }

    /// Resolves once `count` loads have reached the backend
    pub(crate) async fn wait_for_loads(&self, count: usize) {
        let mut started = self.state.loads_started.subscribe();
        let _ = started.wait_for(|n| *n >= count).await;
    }

    /// Prompt contexts received so far, in arrival order
    pub(crate) fn requests(&self) -> Vec<Vec<Message>> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn spawner(&self) -> ThreadSpawner {
        let script = self.clone();
        let factory = move || -> Result<Box<dyn InferenceBackend>, BackendError> {
            Ok(Box::new(ScriptedBackend {
                script: script.clone(),
            }))
        };
        let factory: Arc<dyn BackendFactory> = Arc::new(factory);
        ThreadSpawner::new(factory)
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn load(
        &mut self,
        _model: &ModelDescriptor,
        _config: &ModelConfig,
        progress: &ProgressSink,
    ) -> Result<(), BackendError> {
        let state = &self.script.state;
        let steps = state.progress.lock().unwrap().clone();
        for (fraction, text) in steps {
            progress.step(fraction, text);
        }
        state.loads_started.send_modify(|n| *n += 1);

        let mut open = state.load_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let error = state.load_error.lock().unwrap().clone();
        match error {
            Some(reason) => Err(BackendError::Other(reason)),
            None => Ok(()),
        }
    }

    async fn complete(&mut self, messages: Vec<Message>) -> Result<ChatCompletion, BackendError> {
        let state = &self.script.state;
        state.requests.lock().unwrap().push(messages);

        let mut open = state.completion_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let reply = state.replies.lock().unwrap().pop_front();
        match reply {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(reason)) => Err(BackendError::Other(reason)),
            None => Ok(ChatCompletion::single("ok")),
        }
    }
}

/// Wraps a spawner and records how many workers were alive at each spawn
pub(crate) struct RecordingSpawner {
    inner: ThreadSpawner,
    workers: Mutex<Vec<CancellationToken>>,
    live_at_spawn: Mutex<Vec<usize>>,
}

impl RecordingSpawner {
    pub(crate) fn new(inner: ThreadSpawner) -> Self {
        Self {
            inner,
            workers: Mutex::new(Vec::new()),
            live_at_spawn: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn spawned(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|token| !token.is_cancelled())
            .count()
    }

    pub(crate) fn live_at_spawn(&self) -> Vec<usize> {
        self.live_at_spawn.lock().unwrap().clone()
    }
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(&self) -> Result<WorkerChannel, WorkerSpawnError> {
        let live = self.live_workers();
        self.live_at_spawn.lock().unwrap().push(live);
        let worker = self.inner.spawn()?;
        self.workers.lock().unwrap().push(worker.shutdown_token());
        Ok(worker)
    }
}

/// Host that never allows a background context
pub(crate) struct RefusingSpawner;

impl WorkerSpawner for RefusingSpawner {
    fn spawn(&self) -> Result<WorkerChannel, WorkerSpawnError> {
        Err(WorkerSpawnError::Refused("workers refused by host".into()))
    }
}
