//! Remote object-store sync: idempotent uploads with renew-on-expiry auth.
//!
//! The store exposes a small HTTP surface: an account probe, a token
//! refresh endpoint, per-object metadata, and full-body PUT uploads.
//! Remote object path = configured base namespace + local basename; no
//! directory nesting is preserved.
//!
//! Uploads are idempotent: an object already present with a matching byte
//! size is a skip reported as success. Failures are isolated per file and
//! the local copy is always retained on failure, so no data is lost.

use std::path::Path;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use postvault_shared::{PostVaultError, ProgressEvent, ProgressSink, Result, is_video_file};

/// Per-request timeout for store calls.
const REQUEST_TIMEOUT_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Connection settings for the remote store.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Base URL of the store API.
    pub api_base: String,
    /// Remote namespace uploads land under.
    pub base_path: String,
    /// Bearer token for store calls.
    pub access_token: String,
    /// Refresh token, enabling renew-on-expiry.
    pub refresh_token: Option<String>,
    /// Application key, required alongside the refresh token.
    pub app_key: Option<String>,
    /// Application secret, required alongside the refresh token.
    pub app_secret: Option<String>,
}

/// Remote storage usage, for the status surface.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageUsage {
    /// Bytes used.
    pub used: u64,
    /// Bytes allocated to the account.
    pub allocated: u64,
}

#[derive(Debug, Deserialize)]
struct ObjectMetadata {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

// ---------------------------------------------------------------------------
// RemoteStore
// ---------------------------------------------------------------------------

/// Authenticated client for the remote object store.
#[derive(Debug)]
pub struct RemoteStore {
    client: Client,
    api_base: String,
    base_path: String,
    token: String,
}

/// Steps of the connect/refresh sequence. Refresh is attempted exactly
/// once; a second authorization failure is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Attempting,
    Recovering,
    Retrying,
}

impl RemoteStore {
    /// Connect to the store, validating the access token.
    ///
    /// On an authorization failure, if a refresh token and application
    /// identity are configured, re-authenticates once and retries the
    /// probe; otherwise initialization fails with [`PostVaultError::Auth`].
    #[instrument(skip_all, fields(api_base = %options.api_base))]
    pub async fn connect(options: RemoteOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PostVaultError::Sync(format!("failed to build HTTP client: {e}")))?;

        let mut store = Self {
            client,
            api_base: options.api_base.trim_end_matches('/').to_string(),
            base_path: options.base_path.trim_end_matches('/').to_string(),
            token: options.access_token.clone(),
        };

        let mut state = AuthState::Attempting;
        loop {
            match store.probe_account().await {
                Ok(()) => {
                    if state == AuthState::Retrying {
                        info!("access token refreshed successfully");
                    }
                    return Ok(store);
                }
                Err(ProbeError::Unauthorized) if state == AuthState::Attempting => {
                    state = AuthState::Recovering;
                    let (refresh, key, secret) = match (
                        &options.refresh_token,
                        &options.app_key,
                        &options.app_secret,
                    ) {
                        (Some(r), Some(k), Some(s)) => (r, k, s),
                        _ => {
                            return Err(PostVaultError::Auth(
                                "access token rejected and no refresh credentials configured"
                                    .into(),
                            ));
                        }
                    };
                    info!("access token expired, refreshing");
                    store.token = store.refresh_token(refresh, key, secret).await?;
                    state = AuthState::Retrying;
                }
                Err(ProbeError::Unauthorized) => {
                    return Err(PostVaultError::Auth(
                        "access token still rejected after refresh".into(),
                    ));
                }
                Err(ProbeError::Other(msg)) => return Err(PostVaultError::Sync(msg)),
            }
        }
    }

    /// Validate the current token against the account endpoint.
    async fn probe_account(&self) -> std::result::Result<(), ProbeError> {
        let response = self
            .client
            .get(format!("{}/account", self.api_base))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProbeError::Other(format!("account probe: {e}")))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ProbeError::Unauthorized),
            s => Err(ProbeError::Other(format!("account probe: HTTP {s}"))),
        }
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh_token(
        &self,
        refresh_token: &str,
        app_key: &str,
        app_secret: &str,
    ) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/oauth/token", self.api_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", app_key),
                ("client_secret", app_secret),
            ])
            .send()
            .await
            .map_err(|e| PostVaultError::Auth(format!("token refresh: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostVaultError::Auth(format!("token refresh: HTTP {status}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PostVaultError::Auth(format!("token refresh response: {e}")))?;
        Ok(token.access_token)
    }

    /// Map a local path to its remote object path.
    fn remote_path(&self, local_path: &Path) -> String {
        let basename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{}/{basename}", self.base_path)
    }

    /// Size of the remote object, or `None` when absent.
    async fn remote_size(&self, remote_path: &str) -> Result<Option<u64>> {
        let response = self
            .client
            .get(format!("{}/metadata{remote_path}", self.api_base))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| PostVaultError::Sync(format!("metadata {remote_path}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let meta: ObjectMetadata = response.json().await.map_err(|e| {
                    PostVaultError::Sync(format!("metadata {remote_path}: {e}"))
                })?;
                Ok(Some(meta.size))
            }
            s => Err(PostVaultError::Sync(format!(
                "metadata {remote_path}: HTTP {s}"
            ))),
        }
    }

    /// Upload one file, idempotently.
    ///
    /// Returns true on success (including the already-present skip). Never
    /// propagates errors: a failed upload is reported through the sink and
    /// the return value, and the local file is left in place.
    #[instrument(skip_all, fields(path = %local_path.display()))]
    pub async fn upload(&self, local_path: &Path, sink: &dyn ProgressSink) -> bool {
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| local_path.display().to_string());

        match self.try_upload(local_path).await {
            Ok(skipped) => {
                let message = if skipped {
                    "already present"
                } else {
                    "uploaded"
                };
                debug!(message, "upload finished");
                sink.emit(ProgressEvent::SyncResult {
                    filename,
                    success: true,
                    message: message.into(),
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "upload failed, keeping local file");
                sink.emit(ProgressEvent::SyncResult {
                    filename,
                    success: false,
                    message: e.to_string(),
                });
                false
            }
        }
    }

    /// Upload body: metadata check, then PUT unless the size already
    /// matches. Returns true when the upload was skipped as satisfied.
    async fn try_upload(&self, local_path: &Path) -> Result<bool> {
        let local_size = std::fs::metadata(local_path)
            .map_err(|e| PostVaultError::io(local_path, e))?
            .len();

        let remote_path = self.remote_path(local_path);

        if let Some(remote_size) = self.remote_size(&remote_path).await? {
            if remote_size == local_size {
                info!(%remote_path, size = local_size, "remote copy matches, skipping");
                return Ok(true);
            }
            debug!(
                %remote_path,
                remote_size,
                local_size,
                "size mismatch, overwriting remote copy"
            );
        }

        let body = tokio::fs::read(local_path)
            .await
            .map_err(|e| PostVaultError::io(local_path, e))?;

        let response = self
            .client
            .put(format!("{}/files{remote_path}", self.api_base))
            .bearer_auth(&self.token)
            .body(body)
            .send()
            .await
            .map_err(|e| PostVaultError::Sync(format!("upload {remote_path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostVaultError::Sync(format!(
                "upload {remote_path}: HTTP {status}"
            )));
        }

        info!(%remote_path, size = local_size, "upload complete");
        Ok(false)
    }

    /// Upload every video file under `dir`, recursively.
    ///
    /// Returns `(success_count, failure_count)`; one file's failure never
    /// blocks the others.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub async fn sync_directory(&self, dir: &Path, sink: &dyn ProgressSink) -> (usize, usize) {
        let mut success = 0usize;
        let mut failed = 0usize;

        let files: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| is_video_file(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.into_path())
            .collect();

        info!(files = files.len(), "syncing directory");

        for path in files {
            if self.upload(&path, sink).await {
                success += 1;
            } else {
                failed += 1;
            }
        }

        info!(success, failed, "directory sync finished");
        (success, failed)
    }

    /// Remote storage usage for the account.
    pub async fn account_usage(&self) -> Result<StorageUsage> {
        let response = self
            .client
            .get(format!("{}/account/usage", self.api_base))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| PostVaultError::Sync(format!("usage probe: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostVaultError::Sync(format!("usage probe: HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| PostVaultError::Sync(format!("usage response: {e}")))
    }
}

enum ProbeError {
    Unauthorized,
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use postvault_shared::NullSink;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(server: &MockServer, token: &str) -> RemoteOptions {
        RemoteOptions {
            api_base: server.uri(),
            base_path: "/postvault_videos".into(),
            access_token: token.into(),
            refresh_token: None,
            app_key: None,
            app_secret: None,
        }
    }

    async fn mount_account_ok(server: &MockServer, token: &str) {
        Mock::given(method("GET"))
            .and(path("/account"))
            .and(header("authorization", format!("Bearer {token}")))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn connect_succeeds_with_valid_token() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok-1").await;

        let store = RemoteStore::connect(options(&server, "tok-1")).await;
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn connect_refreshes_expired_token_once() {
        let server = MockServer::start().await;

        // Stale token is rejected; the refreshed one is accepted.
        Mock::given(method("GET"))
            .and(path("/account"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        mount_account_ok(&server, "fresh").await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "fresh" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut opts = options(&server, "stale");
        opts.refresh_token = Some("refresh-1".into());
        opts.app_key = Some("key".into());
        opts.app_secret = Some("secret".into());

        let store = RemoteStore::connect(opts).await.expect("connect");
        assert_eq!(store.token, "fresh");
    }

    #[tokio::test]
    async fn connect_fails_without_refresh_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = RemoteStore::connect(options(&server, "stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, PostVaultError::Auth(_)));
    }

    fn write_local(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).expect("write local file");
        path
    }

    #[tokio::test]
    async fn matching_remote_size_skips_the_transfer() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok").await;

        let dir = tempfile::tempdir().expect("tempdir");
        let local = write_local(&dir, "clip.mp4", "12345");

        Mock::given(method("GET"))
            .and(path("/metadata/postvault_videos/clip.mp4"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "size": 5 })),
            )
            .mount(&server)
            .await;
        // No PUT expected at all.
        Mock::given(method("PUT"))
            .and(path("/files/postvault_videos/clip.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = RemoteStore::connect(options(&server, "tok")).await.unwrap();
        assert!(store.upload(&local, &NullSink).await);
    }

    #[tokio::test]
    async fn size_mismatch_triggers_full_overwrite() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok").await;

        let dir = tempfile::tempdir().expect("tempdir");
        let local = write_local(&dir, "clip.mp4", "12345");

        Mock::given(method("GET"))
            .and(path("/metadata/postvault_videos/clip.mp4"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "size": 999 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/postvault_videos/clip.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = RemoteStore::connect(options(&server, "tok")).await.unwrap();
        assert!(store.upload(&local, &NullSink).await);
    }

    #[tokio::test]
    async fn absent_remote_object_is_uploaded() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok").await;

        let dir = tempfile::tempdir().expect("tempdir");
        let local = write_local(&dir, "clip.mp4", "12345");

        Mock::given(method("GET"))
            .and(path("/metadata/postvault_videos/clip.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/postvault_videos/clip.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = RemoteStore::connect(options(&server, "tok")).await.unwrap();
        assert!(store.upload(&local, &NullSink).await);
    }

    #[tokio::test]
    async fn failed_upload_reports_false_and_keeps_local_file() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok").await;

        let dir = tempfile::tempdir().expect("tempdir");
        let local = write_local(&dir, "clip.mp4", "12345");

        Mock::given(method("GET"))
            .and(path("/metadata/postvault_videos/clip.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/postvault_videos/clip.mp4"))
            .respond_with(ResponseTemplate::new(507))
            .mount(&server)
            .await;

        let store = RemoteStore::connect(options(&server, "tok")).await.unwrap();
        assert!(!store.upload(&local, &NullSink).await);
        assert!(local.exists(), "local file must be retained on failure");
    }

    #[tokio::test]
    async fn sync_directory_counts_per_file_outcomes() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok").await;

        let dir = tempfile::tempdir().expect("tempdir");
        write_local(&dir, "good.mp4", "aaaa");
        write_local(&dir, "bad.mov", "bbbb");
        write_local(&dir, "cover.jpg", "not a video");

        Mock::given(method("GET"))
            .and(path("/metadata/postvault_videos/good.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/postvault_videos/good.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/metadata/postvault_videos/bad.mov"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/files/postvault_videos/bad.mov"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = RemoteStore::connect(options(&server, "tok")).await.unwrap();
        let (success, failed) = store.sync_directory(dir.path(), &NullSink).await;
        assert_eq!((success, failed), (1, 1));
    }

    #[tokio::test]
    async fn account_usage_is_decoded() {
        let server = MockServer::start().await;
        mount_account_ok(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/account/usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "used": 1024, "allocated": 2048 }),
            ))
            .mount(&server)
            .await;

        let store = RemoteStore::connect(options(&server, "tok")).await.unwrap();
        let usage = store.account_usage().await.expect("usage");
        assert_eq!(usage.used, 1024);
        assert_eq!(usage.allocated, 2048);
    }
}
