//! Engine error types.

use crate::transfer::TransferFailure;
use thiserror::Error;

/// Engine operation errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository is busy: {machine} is running {operation}")]
    LockBusy { machine: String, operation: String },

    #[error("stale exclusion lock left behind by {machine}")]
    LockStale { machine: String },

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transfer failed for {} file(s), first: {}", .0.len(), .0.first().map(|f| f.path.as_str()).unwrap_or("?"))]
    TransferFailed(Vec<TransferFailure>),

    #[error("catalog error: {0}")]
    Catalog(#[from] depot_catalog::CatalogError),

    #[error("storage error: {0}")]
    Storage(#[from] depot_storage::StorageError),

    #[error("core error: {0}")]
    Core(#[from] depot_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
