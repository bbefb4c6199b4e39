//! Shared types, error model, and configuration for PostVault.
//!
//! This crate is the foundation depended on by all other PostVault crates.
//! It provides:
//! - [`PostVaultError`], the unified error type
//! - Domain types ([`Post`], [`Attachment`], [`DownloadTask`], [`DownloadOutcome`])
//! - The progress-event contract ([`ProgressEvent`], [`ProgressSink`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod progress;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DownloadConfig, FetchConfig, HistoryConfig, RemoteConfig, TargetEntry, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_config,
};
pub use error::{PostVaultError, Result};
pub use progress::{NullSink, ProgressEvent, ProgressSink};
pub use types::{
    Attachment, DownloadOutcome, DownloadTask, Post, VIDEO_EXTENSIONS, is_video_file,
};
