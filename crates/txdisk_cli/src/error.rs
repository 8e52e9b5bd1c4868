//! CLI errors.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for commands.
pub type CliResult<T> = Result<T, CliError>;

/// Failures that stop a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// The directory has no `logs` subdirectory.
    #[error("{0} is not a txdisk instance directory")]
    NotAnInstance(PathBuf),

    /// Engine-level failure, including log corruption.
    #[error(transparent)]
    Engine(#[from] txdisk_core::TxError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] txdisk_storage::StorageError),

    /// Output could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
