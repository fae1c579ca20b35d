use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chatworker::app::{self, AppState};
use chatworker::storage::settings::{load_settings, load_settings_from};

#[derive(Parser)]
#[command(name = "chatworker")]
#[command(about = "Chat with a local model served over an OpenAI-compatible API")]
#[command(long_about = "chatworker loads one model at a time from a built-in catalog and keeps \
a single conversation with it.\n\n\
Commands:\n\
  /models           List the catalog\n\
  /model <id>       Load a model, discarding the current one\n\
  /history          Print the conversation\n\
  /status           Show the engine state\n\
  /unload           Drop the current model\n\
  /quit             Exit\n\n\
Any other line is sent to the model.")]
struct Args {
    #[arg(short, long, help = "Model to load on startup")]
    model: Option<String>,

    #[arg(short, long, help = "Base URL of the OpenAI-compatible server")]
    endpoint: Option<String>,

    #[arg(long, help = "Path to a settings file")]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatworker=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = match &args.settings {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(model) = args.model {
        settings.default_model = model;
        settings.auto_load_model = true;
    }
    if let Some(endpoint) = args.endpoint {
        settings.endpoint = endpoint;
    }
    settings.validate();

    app::run(AppState::new(settings)).await
}
