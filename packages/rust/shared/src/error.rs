//! Error types for imgdesc.
//!
//! Library crates use [`ImgDescError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-item fetch and inference failures are *not* errors: they are carried as
//! status values on [`FetchResult`](crate::FetchResult) and
//! [`InferenceResult`](crate::InferenceResult). Only run-fatal conditions
//! surface as an [`ImgDescError`].

use std::path::PathBuf;

/// Top-level error type for all imgdesc operations.
#[derive(Debug, thiserror::Error)]
pub enum ImgDescError {
    /// Configuration loading or validation error (invalid range, template, etc.).
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of per-item fetches (client construction, etc.).
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Inference backend setup error.
    #[error("inference error: {0}")]
    Inference(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad table name, schema mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The run could not complete (zero throughput, cancellation, commit failure).
    #[error("run failed: {0}")]
    Run(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ImgDescError>;

impl ImgDescError {
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

    /// Whether this error was raised before any I/O took place.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
