//! Application driver
//!
//! Wires settings, the engine manager and the chat orchestrator together and
//! runs a line-oriented session on stdin/stdout.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::chat::orchestrator::{ChatOrchestrator, IgnoreReason, SendOutcome};
use crate::inference::backend::openai::OpenAiBackendFactory;
use crate::inference::backend::BackendFactory;
use crate::inference::catalog::ModelCatalog;
use crate::inference::lifecycle::EngineManager;
use crate::inference::state::EngineState;
use crate::inference::worker::{ThreadSpawner, WorkerSpawner};
use crate::storage::settings::AppSettings;

/// Global application state shared by the session tasks
#[derive(Clone)]
pub struct AppState {
    pub settings: AppSettings,
    pub engines: Arc<EngineManager>,
    pub chat: Arc<ChatOrchestrator>,
}

impl AppState {
    /// State backed by the OpenAI-compatible HTTP backend
    pub fn new(settings: AppSettings) -> Self {
        let factory: Arc<dyn BackendFactory> =
            Arc::new(OpenAiBackendFactory::new(settings.backend_options()));
        Self::with_spawner(settings, Arc::new(ThreadSpawner::new(factory)))
    }

    pub fn with_spawner(settings: AppSettings, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let engines = Arc::new(EngineManager::new(ModelCatalog::builtin(), spawner));
        let chat = Arc::new(ChatOrchestrator::new(
            engines.clone(),
            settings.system_prompt.clone(),
        ));
        tracing::info!("AppState initialized");
        Self {
            settings,
            engines,
            chat,
        }
    }
}

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Models,
    Model(String),
    History,
    Status,
    Unload,
    Quit,
    Send(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };
        match head {
            "/models" => Command::Models,
            "/model" if !rest.is_empty() => Command::Model(rest.to_string()),
            "/model" => Command::Status,
            "/history" => Command::History,
            "/status" => Command::Status,
            "/unload" => Command::Unload,
            "/quit" | "/exit" => Command::Quit,
            _ => Command::Send(line.to_string()),
        }
    }
}

/// Catalog listing with the selected model marked
pub fn format_models(state: &AppState) -> String {
    let selected = state.engines.selected_model();
    let catalog = state.engines.catalog();
    catalog
        .entries()
        .iter()
        .map(|entry| {
            let marker = if selected.as_ref() == Some(&entry.descriptor) {
                '*'
            } else {
                ' '
            };
            let low = if entry.config.low_resource_required {
                ", low resource"
            } else {
                ""
            };
            format!(
                "{marker} {} ({} ctx, {:.0} MB VRAM{low}) {}",
                entry.descriptor,
                entry.config.context_window_size,
                entry.config.vram_required_mb,
                entry.config.model_url
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_status(state: &AppState) -> String {
    let engine = state.engines.state();
    match state.engines.selected_model() {
        Some(model) => format!("{model}: {}", engine.status_text()),
        None => engine.status_text(),
    }
}

fn spawn_select(state: &AppState, model_id: String, root: &CancellationToken) {
    let engines = state.engines.clone();
    let cancel = root.child_token();
    tokio::spawn(async move {
        if let Err(e) = engines.select_model(&model_id, cancel).await {
            println!("! {e}");
        }
    });
}

fn spawn_send(state: &AppState, text: String, root: &CancellationToken) {
    let chat = state.chat.clone();
    let cancel = root.child_token();
    tokio::spawn(async move {
        match chat.send(&text, &cancel).await {
            SendOutcome::Completed(reply) => println!("{}: {}", reply.role, reply.content),
            SendOutcome::Failed(e) => println!("! {e}"),
            SendOutcome::Ignored(IgnoreReason::Blank) => {}
            SendOutcome::Ignored(IgnoreReason::EngineNotReady) => {
                println!("! Model not ready, use /model <id> to load one")
            }
            SendOutcome::Ignored(IgnoreReason::Busy) => {
                println!("! Still waiting for the previous reply")
            }
        }
    });
}

/// Print engine state changes until `cancel` fires
fn spawn_status_printer(state: &AppState, cancel: CancellationToken) {
    let mut updates = state.engines.subscribe();
    tokio::spawn(async move {
        let mut last_percent = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let current = updates.borrow_and_update().clone();
            // Only print loading progress when the percentage moves
            let percent = current.progress().map(|p| p.percent());
            if matches!(current, EngineState::Loading(_)) && percent == last_percent {
                continue;
            }
            last_percent = percent;
            println!("[{}]", current.status_text());
        }
    });
}

/// Run an interactive session until `/quit` or end of input
pub async fn run(state: AppState) -> std::io::Result<()> {
    let root = CancellationToken::new();
    spawn_status_printer(&state, root.child_token());

    if state.settings.auto_load_model {
        spawn_select(&state, state.settings.default_model.clone(), &root);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Models => println!("{}", format_models(&state)),
            Command::Model(id) => spawn_select(&state, id, &root),
            Command::History => {
                for message in state.chat.history() {
                    println!("{}: {}", message.role, message.content);
                }
            }
            Command::Status => println!("{}", format_status(&state)),
            Command::Unload => state.engines.unload(),
            Command::Quit => break,
            Command::Send(text) => spawn_send(&state, text, &root),
        }
    }

    tracing::info!("Shutting down");
    root.cancel();
    state.engines.unload();
    Ok(())
}
