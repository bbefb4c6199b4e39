//! Core domain types for the PostVault ingestion pipeline.

use serde::{Deserialize, Serialize};

/// File extensions considered video attachments, lowercase without the dot.
///
/// Shared by attachment extraction and directory sync so both sides agree on
/// what counts as media.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "wmv", "flv"];

/// Check whether a filename or URL path ends in a known video extension.
pub fn is_video_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    VIDEO_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

// ---------------------------------------------------------------------------
// Post / Attachment
// ---------------------------------------------------------------------------

/// One downloadable media reference belonging to a [`Post`].
///
/// `filename` doubles as the local basename and the uniqueness key within a
/// post's attachment set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Remote URL of the media file.
    pub url: String,
    /// Destination filename.
    pub filename: String,
}

/// One discoverable content item on the source site.
///
/// Created by the extractor from listing-page markup; immutable afterwards.
/// Every field except `attachments` may be absent; structural gaps in the
/// markup are partial data, not errors. A post without an `id` is still
/// returned but cannot participate in deduplication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    /// Stable post identifier (`data-id`), if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Origin service tag (`data-service`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Owning account identifier (`data-user`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Detail-page URL (possibly relative to the listing page).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Creation timestamp as declared by the markup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Attachment count recovered from the footer text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_count: Option<u64>,
    /// Favorite count recovered from the footer text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite_count: Option<u64>,
    /// Video attachments discovered on the detail page, in document order.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

// ---------------------------------------------------------------------------
// Download tasks and outcomes
// ---------------------------------------------------------------------------

/// A unit of download work, ephemeral for the duration of one run.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Source URL to stream from.
    pub url: String,
    /// Destination filename (basename under the download directory).
    pub filename: String,
    /// Owning post identifier, when known.
    pub post_id: Option<String>,
}

/// Per-task result reported by the download coordinator.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Destination filename of the task.
    pub filename: String,
    /// Whether the local download completed.
    pub downloaded: bool,
    /// Local path, if the file still exists on disk (download succeeded and
    /// was not deleted after a confirmed remote upload).
    pub local_path: Option<std::path::PathBuf>,
    /// Remote sync result, if a remote store was configured for this run.
    pub synced: Option<bool>,
}
