//! Engine lifecycle manager
//!
//! Owns the single engine handle and the observable [`EngineState`]. Model
//! selection tears down the previous engine before a new worker is spawned,
//! so at most one engine is alive at a time.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::inference::catalog::ModelCatalog;
use crate::inference::engine::{EngineError, EngineHandle};
use crate::inference::state::{EngineState, ProgressReport};
use crate::inference::worker::WorkerSpawner;
use crate::types::model::ModelDescriptor;

#[derive(Default)]
struct EngineSlot {
    selected: Option<ModelDescriptor>,
    engine: Option<Arc<EngineHandle>>,
    /// Cancels the load currently in progress
    load: Option<CancellationToken>,
    /// Shutdown token of the worker that load runs in
    loading_worker: Option<CancellationToken>,
    /// Bumped on every selection; stale loads compare against it
    generation: u64,
}

impl EngineSlot {
    /// Cancel the pending load and stop its worker
    fn abandon_load(&mut self) {
        if let Some(load) = self.load.take() {
            load.cancel();
        }
        if let Some(worker) = self.loading_worker.take() {
            worker.cancel();
        }
    }
}

/// Owner of the single active engine and its observable state
pub struct EngineManager {
    catalog: ModelCatalog,
    spawner: Arc<dyn WorkerSpawner>,
    state: watch::Sender<EngineState>,
    slot: Mutex<EngineSlot>,
}

impl EngineManager {
    pub fn new(catalog: ModelCatalog, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (state, _) = watch::channel(EngineState::Uninitialized);
        Self {
            catalog,
            spawner,
            state,
            slot: Mutex::new(EngineSlot::default()),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Latest state
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Watch state changes; only the latest value is kept
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn selected_model(&self) -> Option<ModelDescriptor> {
        self.lock_slot().selected.clone()
    }

    /// Engine to borrow for one request, present only while `Ready`
    pub fn current_engine(&self) -> Option<Arc<EngineHandle>> {
        self.lock_slot().engine.clone()
    }

    /// Whether `engine` is still the installed one
    pub fn is_current(&self, engine: &Arc<EngineHandle>) -> bool {
        self.lock_slot()
            .engine
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, engine))
    }

    /// Bind `model_id` to a fresh engine.
    ///
    /// Re-selecting the model that is already loading or ready is a no-op.
    /// Load failures end in [`EngineState::Failed`] rather than an error; only
    /// an id outside the catalog is rejected.
    pub async fn select_model(
        &self,
        model_id: &str,
        cancel: CancellationToken,
    ) -> Result<EngineState, EngineError> {
        let descriptor = self
            .catalog
            .find(model_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(model_id.to_string()))?;
        let config = self
            .catalog
            .config(&descriptor)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(model_id.to_string()))?;

        let (generation, load) = {
            let mut slot = self.lock_slot();
            if slot.selected.as_ref() == Some(&descriptor) {
                let current = self.state.borrow().clone();
                if current.is_loading() || current.is_ready() {
                    tracing::debug!(model = %descriptor, "Model already selected");
                    return Ok(current);
                }
            }

            slot.abandon_load();
            if let Some(previous) = slot.engine.take() {
                tracing::info!(model = %previous.model(), worker = previous.worker_id(), "Discarding engine");
                previous.discard();
                self.state.send_replace(EngineState::Uninitialized);
            }

            slot.selected = Some(descriptor.clone());
            slot.generation += 1;
            let load = cancel.child_token();
            slot.load = Some(load.clone());
            self.state.send_replace(EngineState::Loading(ProgressReport::new(
                0.0,
                "Loading model...",
            )));
            (slot.generation, load)
        };

        tracing::info!(model = %descriptor, "Loading model");

        let worker = match self.spawner.spawn() {
            Ok(worker) => worker,
            Err(e) => return Ok(self.finish_failed(generation, EngineError::Spawn(e))),
        };
        {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                // Superseded while spawning; dropping the worker stops it
                return Ok(self.state.borrow().clone());
            }
            slot.loading_worker = Some(worker.shutdown_token());
        }

        let created = EngineHandle::create(
            worker,
            descriptor.clone(),
            config,
            |report| self.publish_progress(generation, report),
            &load,
        )
        .await;

        let mut slot = self.lock_slot();
        let current = slot.generation == generation;
        if current {
            slot.load = None;
            slot.loading_worker = None;
        }

        match created {
            Ok(engine) if current => {
                tracing::info!(model = %descriptor, worker = engine.worker_id(), "Model ready");
                slot.engine = Some(Arc::new(engine));
                self.state.send_replace(EngineState::Ready);
            }
            Ok(engine) => {
                tracing::debug!(model = %descriptor, "Superseded load finished, discarding");
                engine.discard();
            }
            Err(EngineError::Cancelled) => {
                tracing::info!(model = %descriptor, "Model load cancelled");
                if current {
                    slot.selected = None;
                    self.state.send_replace(EngineState::Uninitialized);
                }
            }
            Err(e) => {
                if current {
                    tracing::error!(model = %descriptor, "Failed to load model: {}", e);
                    self.state.send_replace(EngineState::Failed(e.to_string()));
                } else {
                    tracing::debug!(model = %descriptor, "Superseded load failed: {}", e);
                }
            }
        }

        Ok(self.state.borrow().clone())
    }

    /// Drop the engine and any load in progress
    pub fn unload(&self) {
        let mut slot = self.lock_slot();
        slot.abandon_load();
        if let Some(engine) = slot.engine.take() {
            tracing::info!(model = %engine.model(), "Unloading engine");
            engine.discard();
        }
        slot.selected = None;
        slot.generation += 1;
        self.state.send_replace(EngineState::Uninitialized);
    }

    fn publish_progress(&self, generation: u64, report: ProgressReport) {
        let slot = self.lock_slot();
        if slot.generation != generation {
            return;
        }
        tracing::debug!(progress = report.progress, "{}", report.text);
        self.state.send_replace(EngineState::Loading(report));
    }

    fn finish_failed(&self, generation: u64, error: EngineError) -> EngineState {
        let mut slot = self.lock_slot();
        if slot.generation == generation {
            tracing::error!("Failed to start engine: {}", error);
            slot.load = None;
            slot.loading_worker = None;
            self.state.send_replace(EngineState::Failed(error.to_string()));
        }
        self.state.borrow().clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, EngineSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        let mut slot = self.lock_slot();
        slot.abandon_load();
        if let Some(engine) = slot.engine.take() {
            engine.discard();
        }
    }
}
