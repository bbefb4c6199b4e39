//! Lifecycle event contract between the pipeline and its consumers.
//!
//! The pipeline emits [`ProgressEvent`]s into a consumer-supplied
//! [`ProgressSink`]. Delivery is best-effort and fire-and-forget: a sink must
//! never propagate failures back into the pipeline. Per-filename ordering is
//! guaranteed: progress events arrive in non-decreasing percent order,
//! followed by exactly one completion event.

/// The closed set of lifecycle events a run can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Listing page parsed; `total_posts` post cards were discovered.
    ScrapeStarted { total_posts: usize },
    /// Post number `index` (1-based) finished processing or was skipped as
    /// already in the history.
    PostProcessed { index: usize, skipped: bool },
    /// `count` new video attachments were discovered on a detail page.
    VideosFound { count: usize },
    /// A download advanced; `percent` is 0 when the server does not
    /// advertise a content length.
    DownloadProgress { filename: String, percent: f64 },
    /// A download finished writing its local file.
    DownloadComplete { filename: String },
    /// A remote upload finished, one way or the other.
    SyncResult {
        filename: String,
        success: bool,
        message: String,
    },
}

/// Consumer of pipeline lifecycle events.
///
/// Implemented externally (console, chat message editor, test recorder).
/// Implementations must be cheap and non-blocking; the pipeline calls
/// `emit` from a single consumer task per run.
pub trait ProgressSink: Send + Sync {
    /// Receive one event. Must not fail.
    fn emit(&self, event: ProgressEvent);
}

/// No-op sink for headless or test usage.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}
