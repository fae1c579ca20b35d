//! Engine state
//!
//! Observable lifecycle of the engine and the progress reports produced while
//! a model loads.

use serde::Serialize;

/// Load progress emitted by the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Completed fraction, always within [0, 1]
    pub progress: f64,
    /// Human-readable description of the current step
    pub text: String,
}

impl ProgressReport {
    pub fn new(progress: f64, text: impl Into<String>) -> Self {
        // clamp passes NaN through
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        Self {
            progress,
            text: text.into(),
        }
    }

    /// Whole percent, rounded down
    pub fn percent(&self) -> u32 {
        (self.progress * 100.0).floor() as u32
    }
}

/// Represents the current state of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineState {
    Uninitialized,
    Loading(ProgressReport),
    Ready,
    Failed(String),
}

impl EngineState {
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineState::Ready)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, EngineState::Loading(_))
    }

    pub fn progress(&self) -> Option<&ProgressReport> {
        match self {
            EngineState::Loading(report) => Some(report),
            _ => None,
        }
    }

    /// Status line shown in place of the progress bar
    pub fn status_text(&self) -> String {
        match self {
            EngineState::Uninitialized => "Model not loaded".to_string(),
            EngineState::Loading(report) => format!("{}% - {}", report.percent(), report.text),
            EngineState::Ready => "Model ready!".to_string(),
            EngineState::Failed(_) => "Error loading model!".to_string(),
        }
    }
}
