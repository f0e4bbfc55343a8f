//! Error type shared by the storage tiers and the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to open offline storage at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("record {id} rejected: {reason}")]
    Rejected { id: String, reason: String },

    #[error("offline storage is shut down")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
