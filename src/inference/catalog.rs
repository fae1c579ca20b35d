//! Model catalog
//!
//! Fixed, ordered set of models the user can pick from, each paired with the
//! configuration the backend needs to load it.

use crate::types::model::{ModelConfig, ModelDescriptor};

/// Catalog entry: descriptor plus its load configuration
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub descriptor: ModelDescriptor,
    pub config: ModelConfig,
}

const BUILTIN: &[CatalogEntry] = &[
    CatalogEntry {
        descriptor: ModelDescriptor::new("Llama-3-8B-Instruct-q4f32_1-MLC"),
        config: ModelConfig {
            model_id: "Llama-3-8B-Instruct-q4f32_1-MLC",
            model_url: "https://huggingface.co/mlc-ai/Llama-3-8B-Instruct-q4f32_1-MLC",
            context_window_size: 4096,
            vram_required_mb: 6101.01,
            low_resource_required: false,
        },
    },
    CatalogEntry {
        descriptor: ModelDescriptor::new("Phi-3-mini-4k-instruct-q4f16_1-MLC"),
        config: ModelConfig {
            model_id: "Phi-3-mini-4k-instruct-q4f16_1-MLC",
            model_url: "https://huggingface.co/mlc-ai/Phi-3-mini-4k-instruct-q4f16_1-MLC",
            context_window_size: 4096,
            vram_required_mb: 3672.07,
            low_resource_required: false,
        },
    },
    CatalogEntry {
        descriptor: ModelDescriptor::new("Gemma-2-2B-it-q4f32_1-MLC"),
        config: ModelConfig {
            model_id: "Gemma-2-2B-it-q4f32_1-MLC",
            model_url: "https://huggingface.co/mlc-ai/gemma-2-2b-it-q4f32_1-MLC",
            context_window_size: 4096,
            vram_required_mb: 2508.75,
            low_resource_required: true,
        },
    },
];

/// Read-only view over the model entries
#[derive(Debug, Clone, Copy)]
pub struct ModelCatalog {
    entries: &'static [CatalogEntry],
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelCatalog {
    pub const fn builtin() -> Self {
        Self { entries: BUILTIN }
    }

    /// Descriptors in display order
    pub fn descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> + '_ {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        self.entries
    }

    pub fn find(&self, id: &str) -> Option<&ModelDescriptor> {
        self.entries
            .iter()
            .find(|e| e.descriptor.id() == id)
            .map(|e| &e.descriptor)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Configuration bundle for a descriptor of this catalog
    pub fn config(&self, descriptor: &ModelDescriptor) -> Option<&ModelConfig> {
        self.entries
            .iter()
            .find(|e| &e.descriptor == descriptor)
            .map(|e| &e.config)
    }

    /// The first entry is the one selected on startup
    pub fn default_model(&self) -> &ModelDescriptor {
        &self.entries[0].descriptor
    }
}
