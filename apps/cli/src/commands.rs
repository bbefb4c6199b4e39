//! CLI command definitions, routing, and tracing setup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::info;

use postvault_core::{Pipeline, RunSummary};
use postvault_fetch::{HttpFetcher, PageFetcher};
use postvault_history::{CorruptPolicy, HistoryStore};
use postvault_shared::{
    AppConfig, ProgressEvent, ProgressSink, init_config, load_config, validate_config,
};
use postvault_sync::{RemoteOptions, RemoteStore};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PostVault — archive new video attachments from post-feed sites.
#[derive(Parser)]
#[command(
    name = "postvault",
    version,
    about = "Watch post listings, download new video attachments, and sync them to remote storage.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one pass over all configured targets.
    Run,

    /// Run continuously, re-checking targets on the configured interval.
    Watch,

    /// Upload every video file in a directory to the remote store.
    Sync {
        /// Directory to walk for video files.
        dir: PathBuf,
    },

    /// Show resolved targets, history size, and remote storage usage.
    Status,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "postvault=info",
        1 => "postvault=debug",
        _ => "postvault=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => cmd_run().await,
        Command::Watch => cmd_watch().await,
        Command::Sync { dir } => cmd_sync(&dir).await,
        Command::Status => cmd_status().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Remote store wiring
// ---------------------------------------------------------------------------

/// Read an env var named by the config, treating empty as unset.
fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Connect to the remote store when one is configured.
///
/// Returns `None` when `remote.api_base` is unset. A configured store with a
/// missing access token is an error, not a silent no-sync.
async fn build_remote(config: &AppConfig) -> Result<Option<RemoteStore>> {
    let Some(api_base) = config.remote.api_base.clone() else {
        return Ok(None);
    };

    let access_token = env_secret(&config.remote.access_token_env).ok_or_else(|| {
        eyre!(
            "remote store configured but {} is not set",
            config.remote.access_token_env
        )
    })?;

    let store = RemoteStore::connect(RemoteOptions {
        api_base,
        base_path: config.remote.base_path.clone(),
        access_token,
        refresh_token: env_secret(&config.remote.refresh_token_env),
        app_key: env_secret(&config.remote.app_key_env),
        app_secret: env_secret(&config.remote.app_secret_env),
    })
    .await?;

    Ok(Some(store))
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Run complete.");
    println!("  Posts found:   {}", summary.posts_found);
    println!("  Skipped:       {}", summary.posts_skipped);
    println!("  Videos queued: {}", summary.videos_found);
    println!("  Downloaded:    {}", summary.downloaded);
    println!("  Synced:        {}", summary.synced);
    println!("  Failed:        {}", summary.failed);
    if summary.targets_failed > 0 {
        println!("  Targets down:  {}", summary.targets_failed);
    }
    println!("  Time:          {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run() -> Result<()> {
    let config = load_config()?;
    validate_config(&config)?;

    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&config.fetch)?);
    let remote = build_remote(&config).await?;
    let sink = Arc::new(ConsoleSink::new());

    let mut pipeline = Pipeline::new(&config, fetcher, remote, sink.clone())?;
    let summary = pipeline.run().await?;

    sink.finish();
    print_summary(&summary);
    Ok(())
}

async fn cmd_watch() -> Result<()> {
    let config = load_config()?;
    validate_config(&config)?;
    let interval = Duration::from_secs(config.interval_minutes * 60);

    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&config.fetch)?);
    let remote = build_remote(&config).await?;
    let sink = Arc::new(ConsoleSink::new());

    let mut pipeline = Pipeline::new(&config, fetcher, remote, sink.clone())?;

    info!(
        interval_minutes = config.interval_minutes,
        "watch loop started"
    );

    loop {
        match pipeline.run().await {
            Ok(summary) => print_summary(&summary),
            // A failed pass never stops the loop; the next tick retries.
            Err(e) => eprintln!("run failed: {e}"),
        }
        info!(minutes = config.interval_minutes, "sleeping until next pass");
        tokio::time::sleep(interval).await;
    }
}

async fn cmd_sync(dir: &PathBuf) -> Result<()> {
    if !dir.is_dir() {
        return Err(eyre!("'{}' is not a directory", dir.display()));
    }

    let config = load_config()?;
    let Some(store) = build_remote(&config).await? else {
        return Err(eyre!(
            "no remote store configured — set remote.api_base in the config file"
        ));
    };

    let sink = Arc::new(ConsoleSink::new());
    let (success, failed) = store.sync_directory(dir, sink.as_ref()).await;
    sink.finish();

    println!();
    println!("  Sync complete: {success} uploaded, {failed} failed");
    println!();
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = load_config()?;

    println!();
    println!("  Targets:");
    if config.targets.is_empty() {
        println!("    (none configured)");
    }
    for target in &config.targets {
        println!("    {} -> {}", target.name, target.url);
    }

    let policy: CorruptPolicy = config.history.on_corrupt.parse()?;
    let history = HistoryStore::load(&config.history.file, policy)?;
    println!("  History:  {} posts ({})", history.len(), config.history.file);
    println!("  Download: {}", config.download.dir);

    match build_remote(&config).await? {
        Some(store) => {
            let usage = store.account_usage().await?;
            let used_mb = usage.used as f64 / 1_048_576.0;
            let allocated_mb = usage.allocated as f64 / 1_048_576.0;
            println!("  Remote:   {used_mb:.1} MB used of {allocated_mb:.1} MB");
        }
        None => println!("  Remote:   not configured"),
    }
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Console progress sink
// ---------------------------------------------------------------------------

/// Indicatif-backed [`ProgressSink`]: a status spinner plus one bar per
/// in-flight download.
struct ConsoleSink {
    multi: MultiProgress,
    spinner: ProgressBar,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ConsoleSink {
    fn new() -> Self {
        let multi = MultiProgress::new();
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self {
            multi,
            spinner,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, filename: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.entry(filename.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(
                    ProgressStyle::with_template("  {bar:30.green} {percent:>3}% {msg}")
                        .unwrap(),
                );
                bar.set_message(filename.to_string());
                bar
            })
            .clone()
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        for bar in bars.values() {
            bar.finish_and_clear();
        }
        bars.clear();
    }
}

impl ProgressSink for ConsoleSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::ScrapeStarted { total_posts } => {
                self.spinner
                    .set_message(format!("Found {total_posts} posts"));
            }
            ProgressEvent::PostProcessed { index, skipped } => {
                let note = if skipped { " (already seen)" } else { "" };
                self.spinner
                    .set_message(format!("Processing post {index}{note}"));
            }
            ProgressEvent::VideosFound { count } => {
                self.spinner
                    .set_message(format!("Queued {count} new videos"));
            }
            ProgressEvent::DownloadProgress { filename, percent } => {
                self.bar_for(&filename).set_position(percent as u64);
            }
            ProgressEvent::DownloadComplete { filename } => {
                let bar = {
                    let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
                    bars.remove(&filename)
                };
                if let Some(bar) = bar {
                    bar.set_position(100);
                    bar.finish_with_message(format!("{filename} done"));
                }
            }
            ProgressEvent::SyncResult {
                filename,
                success,
                message,
            } => {
                let mark = if success { "ok" } else { "FAILED" };
                let _ = self
                    .multi
                    .println(format!("  sync {mark}: {filename} ({message})"));
            }
        }
    }
}
