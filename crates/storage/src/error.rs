//! Error types for the storage adapters.

use std::path::{Path, PathBuf};

use thiserror::Error;

use confluence_core::error::{ConfigError, MergeError};

/// Errors raised while loading or persisting files.
#[derive(Debug, Error)]
pub enum StorageError {
    /// File could not be read or written.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// File content is not the JSON shape expected.
    #[error("Invalid JSON in {path}: {reason}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// Reconciliation CSV could not be parsed.
    #[error("Invalid CSV in {path}: {reason}")]
    Csv {
        /// File involved.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// Configuration check failed (hash mismatch, parse error).
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Domain error while converting loaded data.
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, err: impl ToString) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
