//! Application configuration for PostVault.
//!
//! User config lives at `~/.postvault/postvault.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets (remote store tokens) are read from the environment, never
//! stored in the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PostVaultError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "postvault.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".postvault";

// ---------------------------------------------------------------------------
// Config structs (matching postvault.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// How often the watch loop re-runs the pipeline, in minutes.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Upload each downloaded file to the remote store as it completes.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Named target URLs to scrape, processed sequentially.
    #[serde(default)]
    pub targets: Vec<TargetEntry>,

    /// Page fetching behavior.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Download coordinator behavior.
    #[serde(default)]
    pub download: DownloadConfig,

    /// Dedup history store behavior.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Remote object store settings. Sync is disabled when `api_base`
    /// is unset.
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            auto_sync: default_true(),
            targets: Vec::new(),
            fetch: FetchConfig::default(),
            download: DownloadConfig::default(),
            history: HistoryConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: default_fetch_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// `[[targets]]` entry: one named listing URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEntry {
    /// Short name used in logs and the downloads layout.
    pub name: String,
    /// Listing page URL.
    pub url: String,
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempt budget per page fetch (initial try included).
    #[serde(default = "default_fetch_attempts")]
    pub attempts: u32,

    /// Initial backoff between attempts, in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound on backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interval_minutes() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[download]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory downloads are written to.
    #[serde(default = "default_download_dir")]
    pub dir: String,

    /// Maximum concurrent transfers.
    #[serde(default = "default_download_concurrency")]
    pub concurrency: usize,

    /// Connection timeout per transfer, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for each body read, in seconds. Bounds a stalled peer
    /// without capping the total duration of a large transfer.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: default_download_dir(),
            concurrency: default_download_concurrency(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

fn default_download_dir() -> String {
    "downloads".into()
}
fn default_download_concurrency() -> usize {
    3
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    300
}

/// `[history]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Path of the persisted dedup file.
    #[serde(default = "default_history_file")]
    pub file: String,

    /// What to do when the history file cannot be parsed:
    /// `"reset"` discards it and starts empty, `"fail"` aborts the run.
    #[serde(default = "default_on_corrupt")]
    pub on_corrupt: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file: default_history_file(),
            on_corrupt: default_on_corrupt(),
        }
    }
}

fn default_history_file() -> String {
    "scraped_posts.json".into()
}
fn default_on_corrupt() -> String {
    "reset".into()
}

/// `[remote]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the object-store API. `None` disables remote sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    /// Remote namespace files are uploaded under.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Env var holding the access token (never store the token itself).
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,

    /// Env var holding the refresh token, for renew-on-expiry.
    #[serde(default = "default_refresh_token_env")]
    pub refresh_token_env: String,

    /// Env var holding the application key.
    #[serde(default = "default_app_key_env")]
    pub app_key_env: String,

    /// Env var holding the application secret.
    #[serde(default = "default_app_secret_env")]
    pub app_secret_env: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            base_path: default_base_path(),
            access_token_env: default_access_token_env(),
            refresh_token_env: default_refresh_token_env(),
            app_key_env: default_app_key_env(),
            app_secret_env: default_app_secret_env(),
        }
    }
}

fn default_base_path() -> String {
    "/postvault_videos".into()
}
fn default_access_token_env() -> String {
    "POSTVAULT_ACCESS_TOKEN".into()
}
fn default_refresh_token_env() -> String {
    "POSTVAULT_REFRESH_TOKEN".into()
}
fn default_app_key_env() -> String {
    "POSTVAULT_APP_KEY".into()
}
fn default_app_secret_env() -> String {
    "POSTVAULT_APP_SECRET".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.postvault/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PostVaultError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.postvault/postvault.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PostVaultError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PostVaultError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PostVaultError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PostVaultError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PostVaultError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Validate the loaded config before a run.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.targets.is_empty() {
        return Err(PostVaultError::validation(
            "no targets configured — add a [[targets]] entry with a name and url",
        ));
    }
    if config.interval_minutes < 1 {
        return Err(PostVaultError::validation(
            "interval_minutes must be at least 1",
        ));
    }
    if config.download.concurrency == 0 {
        return Err(PostVaultError::validation(
            "download.concurrency must be at least 1",
        ));
    }
    match config.history.on_corrupt.as_str() {
        "reset" | "fail" => Ok(()),
        other => Err(PostVaultError::validation(format!(
            "history.on_corrupt must be \"reset\" or \"fail\", got \"{other}\""
        ))),
    }
}
