//! Bounded-concurrency media downloads with optional upload-and-release.
//!
//! The coordinator runs a batch of [`DownloadTask`]s under a semaphore,
//! streaming each file to the download directory in chunks. When a remote
//! store is attached, every completed download is uploaded and the local
//! copy is deleted only after the upload is confirmed. Task failures are
//! isolated; the batch always runs to completion and returns one
//! [`DownloadOutcome`] per task, in task order.
//!
//! All lifecycle events funnel through an in-process channel consumed by a
//! single task, so a consumer-facing [`ProgressSink`] never sees interleaved
//! concurrent calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, instrument, warn};

use postvault_shared::{
    DownloadConfig, DownloadOutcome, DownloadTask, PostVaultError, ProgressEvent, ProgressSink,
    Result,
};
use postvault_sync::RemoteStore;

const USER_AGENT: &str = concat!("PostVault/", env!("CARGO_PKG_VERSION"));

/// Sink adapter that forwards events into the coordinator's channel.
struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // The consumer only goes away when the batch is done; a send
        // failure then just drops a late event.
        let _ = self.tx.send(event);
    }
}

/// Batch download coordinator.
pub struct Downloader {
    client: Client,
    download_dir: PathBuf,
    concurrency: usize,
}

impl Downloader {
    /// Build a coordinator writing into `download_dir`.
    ///
    /// Per-read and connect timeouts bound a stalled peer; there is no
    /// whole-request timeout, so large transfers can run as long as bytes
    /// keep arriving.
    pub fn new(config: &DownloadConfig, download_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(std::time::Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| PostVaultError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            download_dir: download_dir.into(),
            concurrency: config.concurrency.max(1),
        })
    }

    /// Run the whole batch. Returns one outcome per task, in task order.
    ///
    /// With a remote store attached, each successfully downloaded file is
    /// uploaded and deleted locally once the upload is confirmed; on upload
    /// failure the local copy stays put.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn download_all(
        &self,
        tasks: &[DownloadTask],
        remote: Option<&RemoteStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> Vec<DownloadOutcome> {
        if tasks.is_empty() {
            return Vec::new();
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
            warn!(dir = %self.download_dir.display(), error = %e, "cannot create download dir");
            return tasks
                .iter()
                .map(|t| DownloadOutcome {
                    filename: t.filename.clone(),
                    downloaded: false,
                    local_path: None,
                    synced: None,
                })
                .collect();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.emit(event);
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let channel_sink = ChannelSink { tx };

        let outcomes = join_all(tasks.iter().map(|task| {
            let semaphore = Arc::clone(&semaphore);
            let sink = &channel_sink;
            async move {
                // A closed semaphore is unreachable here; fall back to a
                // failed outcome rather than aborting the batch.
                let Ok(_permit) = semaphore.acquire().await else {
                    return DownloadOutcome {
                        filename: task.filename.clone(),
                        downloaded: false,
                        local_path: None,
                        synced: None,
                    };
                };
                self.run_task(task, remote, sink).await
            }
        }))
        .await;

        drop(channel_sink);
        if let Err(e) = consumer.await {
            warn!(error = %e, "progress consumer task failed");
        }

        let downloaded = outcomes.iter().filter(|o| o.downloaded).count();
        info!(downloaded, failed = outcomes.len() - downloaded, "batch finished");
        outcomes
    }

    /// One task end to end: download, then optional upload-and-release.
    async fn run_task(
        &self,
        task: &DownloadTask,
        remote: Option<&RemoteStore>,
        sink: &dyn ProgressSink,
    ) -> DownloadOutcome {
        let path = self.download_dir.join(&task.filename);

        if let Err(e) = self.stream_to_file(task, &path, sink).await {
            warn!(
                filename = %task.filename,
                post_id = task.post_id.as_deref().unwrap_or("-"),
                error = %e,
                "download failed"
            );
            // Best-effort cleanup of a partial file.
            let _ = tokio::fs::remove_file(&path).await;
            return DownloadOutcome {
                filename: task.filename.clone(),
                downloaded: false,
                local_path: None,
                synced: None,
            };
        }

        sink.emit(ProgressEvent::DownloadComplete {
            filename: task.filename.clone(),
        });

        let Some(store) = remote else {
            return DownloadOutcome {
                filename: task.filename.clone(),
                downloaded: true,
                local_path: Some(path),
                synced: None,
            };
        };

        let uploaded = store.upload(&path, sink).await;
        let local_path = if uploaded {
            // Local copy is only released once the remote copy is confirmed.
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to delete synced file");
                Some(path)
            } else {
                debug!(filename = %task.filename, "local copy released after upload");
                None
            }
        } else {
            Some(path)
        };

        DownloadOutcome {
            filename: task.filename.clone(),
            downloaded: true,
            local_path,
            synced: Some(uploaded),
        }
    }

    /// Stream the response body to `path`, emitting progress as whole
    /// percents advance. Percent stays 0 when the server does not advertise
    /// a content length.
    async fn stream_to_file(
        &self,
        task: &DownloadTask,
        path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let mut response = self
            .client
            .get(&task.url)
            .send()
            .await
            .map_err(|e| PostVaultError::Network(format!("{}: {e}", task.url)))?
            .error_for_status()
            .map_err(|e| PostVaultError::Network(format!("{}: {e}", task.url)))?;

        let total = response.content_length().filter(|t| *t > 0);
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| PostVaultError::io(path, e))?;

        let mut received: u64 = 0;
        let mut last_percent: i64 = -1;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PostVaultError::Network(format!("{}: {e}", task.url)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| PostVaultError::io(path, e))?;
            received += chunk.len() as u64;

            let percent = total
                .map(|t| (received as f64) * 100.0 / (t as f64))
                .unwrap_or(0.0);
            if percent.floor() as i64 > last_percent {
                last_percent = percent.floor() as i64;
                sink.emit(ProgressEvent::DownloadProgress {
                    filename: task.filename.clone(),
                    percent,
                });
            }
        }

        file.flush().await.map_err(|e| PostVaultError::io(path, e))?;
        debug!(filename = %task.filename, bytes = received, "download written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingSink(Mutex<Vec<ProgressEvent>>);

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<ProgressEvent> {
            self.0.lock().expect("sink lock").clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().expect("sink lock").push(event);
        }
    }

    fn task(server: &MockServer, name: &str) -> DownloadTask {
        DownloadTask {
            url: format!("{}/media/{name}", server.uri()),
            filename: name.to_string(),
            post_id: Some("p1".into()),
        }
    }

    fn downloader(dir: &tempfile::TempDir, concurrency: usize) -> Downloader {
        Downloader::new(
            &DownloadConfig {
                concurrency,
                ..DownloadConfig::default()
            },
            dir.path(),
        )
        .expect("downloader")
    }

    async fn mount_media(server: &MockServer, name: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/media/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_preserves_order() {
        let server = MockServer::start().await;
        mount_media(&server, "a.mp4", b"aaaa").await;
        Mock::given(method("GET"))
            .and(path("/media/b.mp4"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_media(&server, "c.mp4", b"cccc").await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir, 3);
        let tasks = vec![
            task(&server, "a.mp4"),
            task(&server, "b.mp4"),
            task(&server, "c.mp4"),
        ];

        let outcomes = dl
            .download_all(&tasks, None, Arc::new(postvault_shared::NullSink))
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes.iter().map(|o| o.filename.as_str()).collect::<Vec<_>>(),
            vec!["a.mp4", "b.mp4", "c.mp4"]
        );
        assert!(outcomes[0].downloaded);
        assert!(!outcomes[1].downloaded);
        assert!(outcomes[2].downloaded);
        assert!(dir.path().join("a.mp4").exists());
        assert!(!dir.path().join("b.mp4").exists());
        assert!(dir.path().join("c.mp4").exists());
    }

    #[tokio::test]
    async fn progress_is_nondecreasing_and_ends_with_complete() {
        let server = MockServer::start().await;
        mount_media(&server, "a.mp4", &[0u8; 4096]).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir, 1);
        let sink = RecordingSink::new();

        dl.download_all(&[task(&server, "a.mp4")], None, sink.clone())
            .await;

        let events = sink.events();
        assert!(!events.is_empty());

        let mut last = -1.0f64;
        let mut complete_seen = false;
        for event in &events {
            match event {
                ProgressEvent::DownloadProgress { percent, .. } => {
                    assert!(!complete_seen, "no progress after completion");
                    assert!(*percent >= last);
                    last = *percent;
                }
                ProgressEvent::DownloadComplete { .. } => complete_seen = true,
                _ => {}
            }
        }
        assert!(complete_seen);
    }

    #[tokio::test]
    async fn stalled_transfer_fails_instead_of_pinning_a_slot() {
        let server = MockServer::start().await;
        // Peer accepts the request then never sends a byte within the
        // read timeout.
        Mock::given(method("GET"))
            .and(path("/media/stall.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"xxxx".to_vec())
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = Downloader::new(
            &DownloadConfig {
                read_timeout_secs: 1,
                ..DownloadConfig::default()
            },
            dir.path(),
        )
        .expect("downloader");

        let started = Instant::now();
        let outcomes = dl
            .download_all(
                &[task(&server, "stall.mp4")],
                None,
                Arc::new(postvault_shared::NullSink),
            )
            .await;

        assert!(!outcomes[0].downloaded);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "stalled transfer was not cut off by the read timeout"
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_semaphore() {
        let server = MockServer::start().await;
        for name in ["a.mp4", "b.mp4", "c.mp4", "d.mp4"] {
            Mock::given(method("GET"))
                .and(path(format!("/media/{name}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_bytes(b"xxxx".to_vec())
                        .set_delay(Duration::from_millis(250)),
                )
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir, 2);
        let tasks: Vec<_> = ["a.mp4", "b.mp4", "c.mp4", "d.mp4"]
            .iter()
            .map(|n| task(&server, n))
            .collect();

        let started = Instant::now();
        let outcomes = dl
            .download_all(&tasks, None, Arc::new(postvault_shared::NullSink))
            .await;
        let elapsed = started.elapsed();

        assert!(outcomes.iter().all(|o| o.downloaded));
        // Four 250ms bodies at concurrency 2 need at least two rounds.
        assert!(
            elapsed >= Duration::from_millis(450),
            "finished in {elapsed:?}, bound not enforced"
        );
    }

    #[tokio::test]
    async fn confirmed_upload_releases_the_local_copy() {
        let server = MockServer::start().await;
        mount_media(&server, "a.mp4", b"aaaa").await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/metadata/vault/a.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/vault/a.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = RemoteStore::connect(postvault_sync::RemoteOptions {
            api_base: server.uri(),
            base_path: "/vault".into(),
            access_token: "tok".into(),
            refresh_token: None,
            app_key: None,
            app_secret: None,
        })
        .await
        .expect("connect");

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir, 1);

        let outcomes = dl
            .download_all(
                &[task(&server, "a.mp4")],
                Some(&store),
                Arc::new(postvault_shared::NullSink),
            )
            .await;

        assert!(outcomes[0].downloaded);
        assert_eq!(outcomes[0].synced, Some(true));
        assert!(outcomes[0].local_path.is_none());
        assert!(!dir.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn failed_upload_keeps_the_local_copy() {
        let server = MockServer::start().await;
        mount_media(&server, "a.mp4", b"aaaa").await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/metadata/vault/a.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/vault/a.mp4"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = RemoteStore::connect(postvault_sync::RemoteOptions {
            api_base: server.uri(),
            base_path: "/vault".into(),
            access_token: "tok".into(),
            refresh_token: None,
            app_key: None,
            app_secret: None,
        })
        .await
        .expect("connect");

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir, 1);

        let outcomes = dl
            .download_all(
                &[task(&server, "a.mp4")],
                Some(&store),
                Arc::new(postvault_shared::NullSink),
            )
            .await;

        assert!(outcomes[0].downloaded);
        assert_eq!(outcomes[0].synced, Some(false));
        assert_eq!(outcomes[0].local_path.as_deref(), Some(dir.path().join("a.mp4")).as_deref());
        assert!(dir.path().join("a.mp4").exists());
    }
}
