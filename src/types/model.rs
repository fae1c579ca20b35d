//! Model types
//!
//! Defines model descriptors and their static configuration bundles.

use serde::Serialize;

/// Identifier of a selectable model, drawn from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelDescriptor {
    id: &'static str,
}

impl ModelDescriptor {
    pub const fn new(id: &'static str) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }
}

impl std::fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id)
    }
}

/// Configuration handed to the backend when loading a model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    /// Model identifier as understood by the backend
    pub model_id: &'static str,
    /// Where the backend fetches weights from
    pub model_url: &'static str,
    /// Context window size in tokens
    pub context_window_size: u32,
    /// Estimated VRAM needed to host the model
    pub vram_required_mb: f32,
    /// Whether the model fits low-resource devices
    pub low_resource_required: bool,
}
