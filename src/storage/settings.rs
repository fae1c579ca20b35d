//! Settings storage
//!
//! Manages persistence of user preferences and application settings.

use crate::inference::backend::openai::BackendOptions;
use crate::inference::catalog::ModelCatalog;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/v1";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model selected on startup
    pub default_model: String,
    /// System prompt prepended to every completion request
    pub system_prompt: String,
    /// Base URL of the OpenAI-compatible server
    pub endpoint: String,
    /// Bearer token sent with every request, if any
    pub api_key: Option<String>,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
    /// Load the default model on startup
    pub auto_load_model: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_model: ModelCatalog::builtin().default_model().id().to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 1024,
            request_timeout_secs: 120,
            auto_load_model: true,
        }
    }
}

impl AppSettings {
    /// Validate and clamp settings to acceptable ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.max_tokens = self.max_tokens.clamp(16, 32768);
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 3600);

        let catalog = ModelCatalog::builtin();
        if !catalog.contains(&self.default_model) {
            tracing::warn!(
                "Unknown model '{}' in settings, using {}",
                self.default_model,
                catalog.default_model()
            );
            self.default_model = catalog.default_model().id().to_string();
        }

        if self.system_prompt.trim().is_empty() {
            self.system_prompt = DEFAULT_SYSTEM_PROMPT.to_string();
        }

        if self.endpoint.trim().is_empty() {
            self.endpoint = DEFAULT_ENDPOINT.to_string();
        }

        if self.api_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            self.api_key = None;
        }
    }

    /// Connection and sampling options for the HTTP backend
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Load settings from `path`, falling back to defaults on any error
pub fn load_settings_from(path: &Path) -> AppSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the default location
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
