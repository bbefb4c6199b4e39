//! The run orchestrator: fetch, extract, filter, download, sync.
//!
//! One run walks every configured target in order. Per target the listing
//! page is fetched and parsed, detail pages are visited strictly
//! sequentially, already-processed posts are filtered against the history,
//! and all remaining attachments pool into a single bounded download batch.
//! Individual post failures are omissions. A listing fetch that exhausts
//! its retry budget abandons only that target; the run errors only when
//! every configured target is unreachable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use url::Url;

use postvault_download::Downloader;
use postvault_extract::{extract_attachments, extract_posts};
use postvault_fetch::PageFetcher;
use postvault_history::{CorruptPolicy, HistoryStore};
use postvault_shared::{
    AppConfig, DownloadTask, Post, PostVaultError, ProgressEvent, ProgressSink, Result,
    TargetEntry,
};
use postvault_sync::RemoteStore;

/// Per-run export of freshly processed posts, written into the download
/// directory.
const POSTS_EXPORT_FILE: &str = "posts.json";

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Phases a run moves through, in order. `Idle` before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Fetching,
    Extracting,
    Filtering,
    Downloading,
    Syncing,
}

/// Aggregate result of one run across all targets.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Post cards seen on listing pages.
    pub posts_found: usize,
    /// Posts skipped as already in the history.
    pub posts_skipped: usize,
    /// Video attachments queued for download.
    pub videos_found: usize,
    /// Downloads that completed locally.
    pub downloaded: usize,
    /// Uploads confirmed by the remote store.
    pub synced: usize,
    /// Download tasks that failed.
    pub failed: usize,
    /// Targets whose listing page could not be fetched this run.
    pub targets_failed: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The recurring ingestion pipeline.
pub struct Pipeline {
    fetcher: Arc<dyn PageFetcher>,
    downloader: Downloader,
    history: HistoryStore,
    remote: Option<RemoteStore>,
    targets: Vec<TargetEntry>,
    download_dir: PathBuf,
    auto_sync: bool,
    sink: Arc<dyn ProgressSink>,
    phase: RunPhase,
}

impl Pipeline {
    /// Assemble a pipeline from config plus the injected capabilities.
    ///
    /// `remote` is `None` when no store is configured; uploads are attempted
    /// only when a store is present and `auto_sync` is on.
    pub fn new(
        config: &AppConfig,
        fetcher: Arc<dyn PageFetcher>,
        remote: Option<RemoteStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let policy: CorruptPolicy = config.history.on_corrupt.parse()?;
        let history = HistoryStore::load(&config.history.file, policy)?;
        let download_dir = PathBuf::from(&config.download.dir);
        let downloader = Downloader::new(&config.download, &download_dir)?;

        Ok(Self {
            fetcher,
            downloader,
            history,
            remote,
            targets: config.targets.clone(),
            download_dir,
            auto_sync: config.auto_sync,
            sink,
            phase: RunPhase::Idle,
        })
    }

    /// Current phase, for status surfaces and tests.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// The dedup history backing this pipeline.
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(?phase, "phase transition");
        self.phase = phase;
    }

    /// Execute one full pass over all configured targets.
    #[instrument(skip_all, fields(targets = self.targets.len()))]
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        let mut fresh_posts: Vec<Post> = Vec::new();

        let targets = self.targets.clone();
        let mut last_error = None;
        for target in &targets {
            // A dead target never blocks the remaining ones.
            if let Err(e) = self
                .run_target(target, &mut summary, &mut fresh_posts)
                .await
            {
                warn!(target = %target.name, error = %e, "target failed, continuing");
                summary.targets_failed += 1;
                last_error = Some(e);
            }
        }

        self.enter(RunPhase::Idle);
        if let Some(e) = last_error {
            if summary.targets_failed == targets.len() {
                return Err(e);
            }
        }

        self.export_posts(&fresh_posts);

        summary.elapsed = started.elapsed();
        info!(
            posts = summary.posts_found,
            skipped = summary.posts_skipped,
            videos = summary.videos_found,
            downloaded = summary.downloaded,
            synced = summary.synced,
            failed = summary.failed,
            targets_failed = summary.targets_failed,
            "run finished"
        );
        Ok(summary)
    }

    /// One target: listing, details, filter, pooled download batch.
    async fn run_target(
        &mut self,
        target: &TargetEntry,
        summary: &mut RunSummary,
        fresh_posts: &mut Vec<Post>,
    ) -> Result<()> {
        info!(target = %target.name, url = %target.url, "processing target");

        let listing_url = Url::parse(&target.url).map_err(|e| {
            PostVaultError::config(format!("target {}: invalid url: {e}", target.name))
        })?;

        // A listing fetch that exhausts its retries abandons this target.
        self.enter(RunPhase::Fetching);
        let markup = self.fetcher.fetch(&listing_url).await?;

        self.enter(RunPhase::Extracting);
        let posts = extract_posts(&markup);
        summary.posts_found += posts.len();
        self.sink.emit(ProgressEvent::ScrapeStarted {
            total_posts: posts.len(),
        });

        let mut tasks: Vec<DownloadTask> = Vec::new();

        for (i, post) in posts.into_iter().enumerate() {
            let index = i + 1;
            match self.process_post(&listing_url, post).await {
                PostResult::Skipped => {
                    summary.posts_skipped += 1;
                    self.sink
                        .emit(ProgressEvent::PostProcessed { index, skipped: true });
                }
                PostResult::Fresh(post) => {
                    if !post.attachments.is_empty() {
                        self.sink.emit(ProgressEvent::VideosFound {
                            count: post.attachments.len(),
                        });
                    }
                    for attachment in &post.attachments {
                        tasks.push(DownloadTask {
                            url: attachment.url.clone(),
                            filename: attachment.filename.clone(),
                            post_id: post.id.clone(),
                        });
                    }
                    fresh_posts.push(post);
                    self.sink
                        .emit(ProgressEvent::PostProcessed { index, skipped: false });
                }
                PostResult::Unprocessable => {
                    self.sink
                        .emit(ProgressEvent::PostProcessed { index, skipped: false });
                }
            }
        }

        summary.videos_found += tasks.len();

        self.enter(RunPhase::Downloading);
        let remote = if self.auto_sync {
            self.remote.as_ref()
        } else {
            None
        };
        let syncing = remote.is_some();
        let outcomes = self
            .downloader
            .download_all(&tasks, remote, Arc::clone(&self.sink))
            .await;

        if syncing {
            self.enter(RunPhase::Syncing);
        }

        for outcome in &outcomes {
            if outcome.downloaded {
                summary.downloaded += 1;
            } else {
                summary.failed += 1;
            }
            if outcome.synced == Some(true) {
                summary.synced += 1;
            }
        }

        Ok(())
    }

    /// Visit one post's detail page and decide what to do with it.
    ///
    /// Failures here are omissions: the post is dropped from this run and
    /// the next run sees it again.
    async fn process_post(&mut self, listing_url: &Url, mut post: Post) -> PostResult {
        let Some(href) = post.url.as_deref() else {
            debug!("post card without a detail link, dropping");
            return PostResult::Unprocessable;
        };
        let Ok(detail_url) = listing_url.join(href) else {
            warn!(href, "unresolvable detail link, dropping post");
            return PostResult::Unprocessable;
        };

        let markup = match self.fetcher.fetch(&detail_url).await {
            Ok(markup) => markup,
            Err(e) => {
                warn!(url = %detail_url, error = %e, "detail fetch failed, dropping post");
                return PostResult::Unprocessable;
            }
        };

        post.attachments = extract_attachments(&markup, &detail_url);

        self.enter(RunPhase::Filtering);
        if let Some(id) = post.id.clone() {
            if self.history.is_processed(&id, &post.attachments) {
                debug!(id, "post already processed, skipping");
                return PostResult::Skipped;
            }
            // Written during the sequential phase only, before downloads run.
            if let Err(e) = self.history.record(&id, &post) {
                warn!(id, error = %e, "failed to persist history record");
            }
        }

        PostResult::Fresh(post)
    }

    /// Write the freshly processed posts of this run into the download
    /// directory. Best-effort: an export failure never fails the run.
    fn export_posts(&self, posts: &[Post]) {
        if posts.is_empty() {
            return;
        }
        let path = self.download_dir.join(POSTS_EXPORT_FILE);
        let result = serde_json::to_string_pretty(posts)
            .map_err(|e| PostVaultError::parse(e.to_string()))
            .and_then(|json| {
                std::fs::create_dir_all(&self.download_dir)
                    .and_then(|()| std::fs::write(&path, json))
                    .map_err(|e| PostVaultError::io(&path, e))
            });
        match result {
            Ok(()) => debug!(path = %path.display(), count = posts.len(), "posts exported"),
            Err(e) => warn!(error = %e, "posts export failed"),
        }
    }
}

enum PostResult {
    /// New or changed; attachments queued and history updated.
    Fresh(Post),
    /// Attachment set unchanged since last processing.
    Skipped,
    /// Missing link or failed detail fetch; try again next run.
    Unprocessable,
}
