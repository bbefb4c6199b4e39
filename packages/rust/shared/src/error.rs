//! Error types for PostVault.
//!
//! Library crates use [`PostVaultError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all PostVault operations.
#[derive(Debug, thiserror::Error)]
pub enum PostVaultError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during fetching or downloading.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or post extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// History (dedup store) load or persist error.
    #[error("history error: {0}")]
    History(String),

    /// Remote object-store sync error.
    #[error("sync error: {0}")]
    Sync(String),

    /// Remote store authorization error (unrecoverable after refresh).
    #[error("auth error: {0}")]
    Auth(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad URL, empty target list, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PostVaultError>;

impl PostVaultError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
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
