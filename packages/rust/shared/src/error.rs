//! Error types for Examflow.
//!
//! Library crates use [`ExamflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Examflow operations.
#[derive(Debug, thiserror::Error)]
pub enum ExamflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error reaching an external provider.
    #[error("network error: {0}")]
    Network(String),

    /// Classifier call failed or returned a malformed response. Fatal to the
    /// item being processed; never silently recovered.
    #[error("classification error: {0}")]
    Classification(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Attempted deletion of a topic still referenced by items. Aborts only
    /// that single deletion.
    #[error("topic {topic_id} is referenced by {item_count} item(s)")]
    TopicInUse { topic_id: String, item_count: u64 },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad row, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ExamflowError>;

impl ExamflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
