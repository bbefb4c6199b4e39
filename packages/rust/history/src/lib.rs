//! Durable dedup history: which posts were already fully processed.
//!
//! The store maps post identifier → last-seen [`Post`] (including its
//! attachment filename set). It is loaded fully into memory at startup and
//! rewritten wholesale on every [`HistoryStore::record`]: write-through, no
//! batching, because each run is small and correctness under crash matters
//! more than write throughput.
//!
//! A post counts as already processed only when its freshly-parsed
//! attachment filename set exactly equals the stored set. Supersets and
//! subsets both mean the post changed upstream and must be re-processed.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use postvault_shared::{Attachment, Post, PostVaultError, Result};

// ---------------------------------------------------------------------------
// Corruption policy
// ---------------------------------------------------------------------------

/// What to do when the history file exists but cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptPolicy {
    /// Discard the unreadable history and start empty (availability over
    /// strict history).
    Reset,
    /// Abort the run and keep the file for inspection.
    Fail,
}

impl std::str::FromStr for CorruptPolicy {
    type Err = PostVaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reset" => Ok(Self::Reset),
            "fail" => Ok(Self::Fail),
            other => Err(PostVaultError::config(format!(
                "unknown on_corrupt policy \"{other}\""
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

/// One persisted entry: the post as last processed, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The post exactly as parsed at last processing time.
    pub post: Post,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

/// In-memory view of the persisted dedup file.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    records: HashMap<String, HistoryRecord>,
}

impl HistoryStore {
    /// Load the store from `path`. A missing file is an empty store; an
    /// unparseable file is handled per `policy`.
    pub fn load(path: impl Into<PathBuf>, policy: CorruptPolicy) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            debug!(?path, "no history file, starting empty");
            return Ok(Self {
                path,
                records: HashMap::new(),
            });
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| PostVaultError::io(&path, e))?;

        match serde_json::from_str::<HashMap<String, HistoryRecord>>(&content) {
            Ok(records) => {
                debug!(?path, entries = records.len(), "history loaded");
                Ok(Self { path, records })
            }
            Err(e) => match policy {
                CorruptPolicy::Reset => {
                    warn!(?path, error = %e, "history file unreadable, discarding");
                    Ok(Self {
                        path,
                        records: HashMap::new(),
                    })
                }
                CorruptPolicy::Fail => Err(PostVaultError::History(format!(
                    "corrupt history file {}: {e}",
                    path.display()
                ))),
            },
        }
    }

    /// Number of recorded posts.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no posts are recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Is this post already fully processed?
    ///
    /// True iff a record exists for `id` and the stored attachment filename
    /// set exactly equals the filename set of `attachments`.
    pub fn is_processed(&self, id: &str, attachments: &[Attachment]) -> bool {
        let Some(record) = self.records.get(id) else {
            return false;
        };
        filename_set(&record.post.attachments) == filename_set(attachments)
    }

    /// Overwrite the record for `id` and persist immediately.
    pub fn record(&mut self, id: &str, post: &Post) -> Result<()> {
        self.records.insert(
            id.to_string(),
            HistoryRecord {
                post: post.clone(),
                recorded_at: Utc::now(),
            },
        );
        self.persist()
    }

    /// Rewrite the whole file. Writes to a sibling temp file first so a
    /// crash mid-write cannot leave a truncated history behind.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PostVaultError::io(parent, e))?;
            }
        }

        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|e| PostVaultError::History(format!("serialize history: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| PostVaultError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| PostVaultError::io(&self.path, e))?;

        debug!(path = ?self.path, entries = self.records.len(), "history persisted");
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Attachment filenames as the dedup fingerprint.
fn filename_set(attachments: &[Attachment]) -> BTreeSet<&str> {
    attachments.iter().map(|a| a.filename.as_str()).collect()
}
