//! Persistent storage
//!
//! This module handles persistence of application settings.

use std::path::PathBuf;

use directories::ProjectDirs;
use thiserror::Error;

pub mod settings;

/// Errors raised while reading or writing stored data
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not determine the data directory")]
    NoDataDir,
}

/// Per-user data directory for chatworker
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("org", "chatworker", "chatworker")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
