use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AttachmentConfig;
use crate::db::{Attachment, AttachmentStatus, AttachmentStore};
use crate::notify::{Notifier, SyncEvent};
use crate::sync::Pacer;
use crate::upstream::http::retry_after_from;
use crate::utils::SyncError;

pub mod cleanup;
pub mod policy;
pub mod retry;
pub mod storage;
pub mod worker;

pub use self::cleanup::{ReconcileReport, Reconciler};
pub use self::policy::AttachmentPolicy;
pub use self::retry::RetryPolicy;
pub use self::storage::{AttachmentStorage, StorageLocation};
pub use self::worker::{DownloadWorker, WorkerPass};

/// An open download: declared metadata plus the body as a byte stream.
pub struct FileStream {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, SyncError>>,
}

/// The file host attachments are fetched from.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<FileStream, SyncError>;
}

pub struct HttpFileSource {
    http: Client,
}

impl HttpFileSource {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl FileSource for HttpFileSource {
    async fn open(&self, url: &str) -> Result<FileStream, SyncError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("download request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
                    SyncError::PermanentIo(format!("CDN URL expired ({status})"))
                }
                StatusCode::TOO_MANY_REQUESTS => SyncError::TransientIo {
                    message: "file host rate limited the download".to_string(),
                    retry_after: retry_after_from(response.headers()),
                },
                StatusCode::REQUEST_TIMEOUT => SyncError::transient("file host timed out"),
                status if status.is_server_error() => {
                    SyncError::transient(format!("file host error {status}"))
                }
                status => SyncError::PermanentIo(format!("unexpected status {status}")),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        Ok(FileStream {
            content_length: response.content_length(),
            content_type,
            body: response
                .bytes_stream()
                .map(|chunk| {
                    chunk.map_err(|e| SyncError::transient(format!("download interrupted: {e}")))
                })
                .boxed(),
        })
    }
}

/// What happened to one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    Deduplicated,
    AlreadyCached,
    Queued,
    Skipped(String),
    Failed { error: String, retryable: bool },
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub auto_download: bool,
    pub background_threshold: u64,
    pub max_concurrent_downloads: usize,
    pub download_timeout: Duration,
    pub download_delay: Duration,
    pub deduplicate_by_hash: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &AttachmentConfig) -> Self {
        Self {
            auto_download: config.auto_download,
            background_threshold: config.background_threshold,
            max_concurrent_downloads: config.max_concurrent_downloads.max(1),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            download_delay: Duration::from_millis(config.download_delay_ms),
            deduplicate_by_hash: config.deduplicate_by_hash,
        }
    }
}

struct Fetched {
    part: std::path::PathBuf,
    hash: String,
    bytes: u64,
}

/// Downloads attachments into content-deduplicated local storage.
pub struct AttachmentPipeline {
    store: Arc<dyn AttachmentStore>,
    source: Arc<dyn FileSource>,
    storage: AttachmentStorage,
    policy: AttachmentPolicy,
    retry: RetryPolicy,
    settings: PipelineSettings,
    slots: Arc<Semaphore>,
    pacer: Pacer,
    // Serialises hash lookup plus commit so identical content lands once.
    commit_lock: Mutex<()>,
    notifier: Notifier,
}

impl AttachmentPipeline {
    pub fn new(
        store: Arc<dyn AttachmentStore>,
        source: Arc<dyn FileSource>,
        config: &AttachmentConfig,
        notifier: Notifier,
    ) -> Self {
        let settings = PipelineSettings::from_config(config);
        Self {
            store,
            source,
            storage: AttachmentStorage::new(config.storage_path.clone()),
            policy: AttachmentPolicy::from_config(config),
            retry: RetryPolicy::new(
                config.max_retry_attempts,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
            slots: Arc::new(Semaphore::new(settings.max_concurrent_downloads)),
            pacer: Pacer::new(settings.download_delay),
            settings,
            commit_lock: Mutex::new(()),
            notifier,
        }
    }

    pub fn storage(&self) -> &AttachmentStorage {
        &self.storage
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Entry point for freshly synced attachments: large files and disabled
    /// auto-download go to the queue, the rest is downloaded now.
    pub async fn process(
        &self,
        mut attachment: Attachment,
        location: StorageLocation,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, SyncError> {
        if attachment.status == AttachmentStatus::Completed
            && attachment.cached
            && self.cached_file_present(&attachment).await
        {
            return Ok(DownloadOutcome::AlreadyCached);
        }
        if matches!(
            attachment.status,
            AttachmentStatus::Skipped | AttachmentStatus::InProgress
        ) || (attachment.status == AttachmentStatus::Failed
            && !attachment.awaits_download(self.retry.max_attempts()))
        {
            return Ok(current_outcome(&attachment));
        }

        let oversized = attachment.size > 0 && attachment.size as u64 > self.policy.max_file_size();
        let background =
            attachment.size > 0 && attachment.size as u64 > self.settings.background_threshold;
        if !oversized && (background || !self.settings.auto_download) {
            if attachment.status != AttachmentStatus::Queued {
                attachment.mark_queued();
                self.store.update_attachment_tracking(&attachment).await?;
                debug!(
                    "queued attachment {} ({} bytes) for the worker",
                    attachment.id, attachment.size
                );
            }
            return Ok(DownloadOutcome::Queued);
        }

        self.download(attachment, location, cancel).await
    }

    /// Downloads one attachment now, retrying transient failures.
    ///
    /// Failures are recorded on the attachment and returned as an outcome;
    /// `Err` means cancellation or a storage/database fault.
    pub async fn download(
        &self,
        mut attachment: Attachment,
        location: StorageLocation,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, SyncError> {
        if attachment.cached {
            if self.cached_file_present(&attachment).await {
                return Ok(DownloadOutcome::AlreadyCached);
            }
            attachment.reset_cache();
        }

        if let Err(reason) = self.policy.evaluate(
            attachment.size,
            attachment.content_type.as_deref(),
            &attachment.filename,
        ) {
            info!("skipping attachment {}: {}", attachment.id, reason);
            attachment.mark_skipped(reason.clone());
            self.store.update_attachment_tracking(&attachment).await?;
            return Ok(DownloadOutcome::Skipped(reason));
        }

        if self.settings.deduplicate_by_hash {
            if let Some(hash) = attachment.content_hash.clone() {
                if let Some(path) = self.find_cached_copy(&hash, &attachment).await? {
                    attachment.mark_cached(path, hash);
                    self.store.update_attachment_tracking(&attachment).await?;
                    self.announce(&attachment, 0, true).await;
                    return Ok(DownloadOutcome::Deduplicated);
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                return self.abandon(attachment).await;
            }
            attachment.mark_downloading();
            self.store.update_attachment_tracking(&attachment).await?;

            let error = match self.fetch(&attachment, &location, cancel).await {
                Ok(fetched) => return self.finish(attachment, &location, fetched).await,
                Err(SyncError::Cancelled) => return self.abandon(attachment).await,
                Err(SyncError::Capacity(reason)) => {
                    info!("skipping attachment {}: {}", attachment.id, reason);
                    attachment.mark_skipped(reason.clone());
                    self.store.update_attachment_tracking(&attachment).await?;
                    return Ok(DownloadOutcome::Skipped(reason));
                }
                Err(error @ (SyncError::Database(_) | SyncError::Storage(_))) => {
                    attachment.mark_failed(error.to_string(), true);
                    self.store.update_attachment_tracking(&attachment).await?;
                    return Err(error);
                }
                Err(error) => error,
            };

            let attempts = attachment.attempts.max(0) as u32;
            let retryable = error.is_retryable();
            attachment.mark_failed(error.to_string(), retryable);
            self.store.update_attachment_tracking(&attachment).await?;

            if !self.retry.should_retry(&error, attempts) {
                warn!(
                    "attachment {} failed after {} attempt(s): {}",
                    attachment.id, attempts, error
                );
                self.notifier
                    .sync_error(None, "attachment", attachment.id, &error)
                    .await;
                return Ok(DownloadOutcome::Failed {
                    error: error.to_string(),
                    retryable,
                });
            }

            let delay = self.retry.delay(attempts, error.retry_after());
            debug!(
                "retrying attachment {} in {:?} after: {}",
                attachment.id, delay, error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return self.abandon(attachment).await,
            }
        }
    }

    async fn cached_file_present(&self, attachment: &Attachment) -> bool {
        match attachment.local_path.as_deref() {
            Some(path) => self.storage.exists(path).await,
            None => false,
        }
    }

    async fn find_cached_copy(
        &self,
        hash: &str,
        attachment: &Attachment,
    ) -> Result<Option<String>, SyncError> {
        let Some(other) = self.store.find_cached_by_hash(hash, attachment.id).await? else {
            return Ok(None);
        };
        match other.local_path {
            Some(path) if self.storage.exists(&path).await => Ok(Some(path)),
            _ => Ok(None),
        }
    }

    async fn fetch(
        &self,
        attachment: &Attachment,
        location: &StorageLocation,
        cancel: &CancellationToken,
    ) -> Result<Fetched, SyncError> {
        let _slot = tokio::select! {
            slot = self.slots.clone().acquire_owned() => slot.map_err(|_| SyncError::Cancelled)?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };
        self.pacer.wait().await;

        let part = self.storage.part_file(location).await?;
        let result = tokio::select! {
            result = tokio::time::timeout(
                self.settings.download_timeout,
                self.stream_to(&attachment.url, &part),
            ) => result.unwrap_or_else(|_| Err(SyncError::transient(format!(
                "download timed out after {:?}",
                self.settings.download_timeout
            )))),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        };

        match result {
            Ok((hash, bytes)) => Ok(Fetched { part, hash, bytes }),
            Err(err) => {
                self.storage.remove(&part).await;
                Err(err)
            }
        }
    }

    async fn stream_to(&self, url: &str, part: &Path) -> Result<(String, u64), SyncError> {
        let limit = self.policy.max_file_size();
        let mut stream = self.source.open(url).await?;
        if let Some(length) = stream.content_length.filter(|length| *length > limit) {
            return Err(SyncError::Capacity(format!(
                "file size {length} exceeds limit {limit}"
            )));
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.body.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(SyncError::Capacity(format!(
                    "download exceeded limit {limit} mid-stream"
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok((hex::encode(hasher.finalize()), written))
    }

    async fn finish(
        &self,
        mut attachment: Attachment,
        location: &StorageLocation,
        fetched: Fetched,
    ) -> Result<DownloadOutcome, SyncError> {
        let _guard = self.commit_lock.lock().await;

        if self.settings.deduplicate_by_hash {
            if let Some(path) = self.find_cached_copy(&fetched.hash, &attachment).await? {
                self.storage.remove(&fetched.part).await;
                debug!(
                    "attachment {} duplicates content already stored at {}",
                    attachment.id, path
                );
                attachment.mark_cached(path, fetched.hash);
                self.store.update_attachment_tracking(&attachment).await?;
                self.announce(&attachment, fetched.bytes, true).await;
                return Ok(DownloadOutcome::Deduplicated);
            }
        }

        let path = match self
            .storage
            .commit(&fetched.part, location, &attachment.filename)
            .await
        {
            Ok(path) => path,
            Err(err) => {
                self.storage.remove(&fetched.part).await;
                attachment.mark_failed(err.to_string(), true);
                self.store.update_attachment_tracking(&attachment).await?;
                return Err(err);
            }
        };
        attachment.mark_cached(path, fetched.hash);
        self.store.update_attachment_tracking(&attachment).await?;
        info!(
            "downloaded attachment {} ({} bytes)",
            attachment.id, fetched.bytes
        );
        self.announce(&attachment, fetched.bytes, false).await;
        Ok(DownloadOutcome::Downloaded {
            bytes: fetched.bytes,
        })
    }

    // A half-written file cannot be trusted; the record is failed but retryable.
    async fn abandon(&self, mut attachment: Attachment) -> Result<DownloadOutcome, SyncError> {
        attachment.mark_failed("download cancelled".to_string(), true);
        self.store.update_attachment_tracking(&attachment).await?;
        Err(SyncError::Cancelled)
    }

    async fn announce(&self, attachment: &Attachment, bytes: u64, deduplicated: bool) {
        self.notifier
            .publish(SyncEvent::AttachmentDownloaded {
                attachment_id: attachment.id,
                message_id: attachment.message_id,
                bytes,
                deduplicated,
            })
            .await;
    }
}

fn current_outcome(attachment: &Attachment) -> DownloadOutcome {
    match attachment.status {
        AttachmentStatus::Skipped => {
            DownloadOutcome::Skipped(attachment.skip_reason.clone().unwrap_or_default())
        }
        AttachmentStatus::Queued | AttachmentStatus::InProgress | AttachmentStatus::Pending => {
            DownloadOutcome::Queued
        }
        AttachmentStatus::Completed => DownloadOutcome::AlreadyCached,
        AttachmentStatus::Failed => DownloadOutcome::Failed {
            error: attachment.last_error.clone().unwrap_or_default(),
            retryable: attachment.retryable,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ReferenceMode, Services};
    use crate::test_support::{
        FakeFileSource, FakeResponse, RecordingPublisher, TestDb, attachment_dto, message_dto,
        seed_channel, sf,
    };

    struct Fixture {
        _db: TestDb,
        services: Services,
        source: Arc<FakeFileSource>,
        recorder: Arc<RecordingPublisher>,
        pipeline: AttachmentPipeline,
    }

    fn config(root: &Path) -> AttachmentConfig {
        AttachmentConfig {
            storage_path: root.to_path_buf(),
            max_file_size: 64,
            background_threshold: 32,
            retry_base_delay_ms: 1,
            download_delay_ms: 0,
            ..AttachmentConfig::default()
        }
    }

    async fn fixture_with(tweak: impl FnOnce(&mut AttachmentConfig)) -> Fixture {
        let db = TestDb::new().await;
        seed_channel(&db, 1, 10).await;
        let services = Services::new(&db.manager);
        let source = Arc::new(FakeFileSource::default());
        let recorder = Arc::new(RecordingPublisher::default());
        let mut config = config(&db.dir.path().join("files"));
        tweak(&mut config);
        let pipeline = AttachmentPipeline::new(
            db.manager.attachment_store(),
            source.clone(),
            &config,
            Notifier::new(recorder.clone(), Duration::from_secs(1)),
        );
        Fixture {
            _db: db,
            services,
            source,
            recorder,
            pipeline,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    fn location(message: u64) -> StorageLocation {
        StorageLocation {
            community_id: sf(1),
            channel_id: sf(10),
            message_id: sf(message),
        }
    }

    /// Stores message `message` carrying one attachment per `(id, size)`.
    async fn attach(fx: &Fixture, message: u64, files: &[(u64, i64)]) -> Vec<Attachment> {
        let mut dto = message_dto(message, 10, 5);
        dto.attachments = files.iter().map(|(id, size)| attachment_dto(*id, *size)).collect();
        fx.services
            .messages
            .upsert(&dto, ReferenceMode::Deferred)
            .await
            .unwrap()
            .attachments
    }

    fn url(id: u64) -> String {
        attachment_dto(id, 0).url
    }

    async fn files_on_disk(fx: &Fixture) -> usize {
        let mut count = 0;
        let mut stack = vec![fx.pipeline.storage().root().to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await.unwrap() {
                if entry.file_type().await.unwrap().is_dir() {
                    stack.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn download_stores_file_and_hash() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 11)]).await.remove(0);
        fx.source.respond(&url(7), [FakeResponse::png(b"hello world")]);

        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 11 });

        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.status, AttachmentStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.local_path.as_deref(), Some("1/10/100/file-7.png"));
        assert_eq!(
            stored.content_hash.as_deref(),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        let bytes = tokio::fs::read(fx.pipeline.storage().absolute("1/10/100/file-7.png"))
            .await
            .unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(fx.recorder.names(), vec!["attachment_downloaded"]);
    }

    #[tokio::test]
    async fn download_of_older_snapshot_keeps_refreshed_metadata() {
        let fx = fixture().await;
        let snapshot = attach(&fx, 100, &[(7, 11)]).await.remove(0);

        let mut refreshed = message_dto(100, 10, 5);
        let mut file = attachment_dto(7, 11);
        file.filename = "renamed.png".to_string();
        file.url = "https://cdn.test/7/renamed.png".to_string();
        refreshed.attachments = vec![file];
        fx.services
            .messages
            .upsert(&refreshed, ReferenceMode::Deferred)
            .await
            .unwrap();

        fx.source.respond(&url(7), [FakeResponse::png(b"hello world")]);
        let outcome = fx
            .pipeline
            .process(snapshot, location(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 11 });

        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.url, "https://cdn.test/7/renamed.png");
        assert_eq!(stored.filename, "renamed.png");
        assert_eq!(stored.status, AttachmentStatus::Completed);
        assert!(stored.cached);
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let fx = fixture().await;
        let first = attach(&fx, 100, &[(7, 5)]).await.remove(0);
        let second = attach(&fx, 101, &[(8, 5)]).await.remove(0);
        fx.source.respond(&url(7), [FakeResponse::png(b"same!")]);
        fx.source.respond(&url(8), [FakeResponse::png(b"same!")]);
        let cancel = CancellationToken::new();

        fx.pipeline.process(first, location(100), &cancel).await.unwrap();
        let outcome = fx.pipeline.process(second, location(101), &cancel).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Deduplicated);

        let a = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        let b = fx.services.attachments.get(sf(8)).await.unwrap().unwrap();
        assert_eq!(a.local_path, b.local_path);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(files_on_disk(&fx).await, 1);
    }

    #[tokio::test]
    async fn known_hash_skips_network() {
        let fx = fixture().await;
        let first = attach(&fx, 100, &[(7, 5)]).await.remove(0);
        fx.source.respond(&url(7), [FakeResponse::png(b"same!")]);
        let cancel = CancellationToken::new();
        fx.pipeline.process(first, location(100), &cancel).await.unwrap();
        let hash = fx
            .services
            .attachments
            .get(sf(7))
            .await
            .unwrap()
            .unwrap()
            .content_hash;

        let mut second = attach(&fx, 101, &[(8, 5)]).await.remove(0);
        second.content_hash = hash;
        let outcome = fx.pipeline.download(second, location(101), &cancel).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Deduplicated);
        assert_eq!(fx.source.opens(&url(8)), 0);
    }

    #[tokio::test]
    async fn oversized_attachment_is_skipped_without_transfer() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 65)]).await.remove(0);
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Skipped(_)));
        assert_eq!(fx.source.total_opens(), 0);
        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.status, AttachmentStatus::Skipped);
        assert!(stored.skip_reason.is_some_and(|reason| !reason.is_empty()));
    }

    #[tokio::test]
    async fn undeclared_oversize_aborts_mid_stream() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 0)]).await.remove(0);
        fx.source.respond(
            &url(7),
            [FakeResponse::Body {
                bytes: vec![0u8; 100],
                content_type: None,
                declare_length: false,
            }],
        );
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Skipped(_)));
        assert_eq!(files_on_disk(&fx).await, 0);
    }

    #[tokio::test]
    async fn large_files_are_queued() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 40)]).await.remove(0);
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Queued);
        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.status, AttachmentStatus::Queued);
        assert_eq!(fx.source.total_opens(), 0);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 4)]).await.remove(0);
        fx.source.respond(
            &url(7),
            [FakeResponse::Transient, FakeResponse::png(b"data")],
        );
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 4 });
        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn retries_stop_at_ceiling() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 4)]).await.remove(0);
        fx.source.respond(&url(7), [FakeResponse::Transient]);
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Failed { retryable: true, .. }));
        assert_eq!(fx.source.opens(&url(7)), 3);
        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert!(!stored.awaits_download(3));
    }

    #[tokio::test]
    async fn expired_url_is_not_retried() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 4)]).await.remove(0);
        fx.source.respond(&url(7), [FakeResponse::Permanent]);
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, DownloadOutcome::Failed { retryable: false, .. }));
        assert_eq!(fx.source.opens(&url(7)), 1);
        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.status, AttachmentStatus::Failed);
        assert!(stored.last_error.is_some_and(|e| e.contains("expired")));
        assert!(fx.recorder.names().contains(&"sync_error"));
    }

    #[tokio::test]
    async fn cancelled_download_is_marked_failed() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 4)]).await.remove(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx.pipeline.process(attachment, location(100), &cancel).await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        assert_eq!(stored.status, AttachmentStatus::Failed);
        assert!(stored.retryable);
    }

    #[tokio::test]
    async fn cached_file_short_circuits() {
        let fx = fixture().await;
        let attachment = attach(&fx, 100, &[(7, 4)]).await.remove(0);
        fx.source.respond(&url(7), [FakeResponse::png(b"data")]);
        let cancel = CancellationToken::new();
        fx.pipeline.process(attachment, location(100), &cancel).await.unwrap();

        let stored = fx.services.attachments.get(sf(7)).await.unwrap().unwrap();
        let outcome = fx.pipeline.process(stored, location(100), &cancel).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::AlreadyCached);
        assert_eq!(fx.source.opens(&url(7)), 1);
    }

    #[tokio::test]
    async fn disabled_auto_download_defers_everything() {
        let fx = fixture_with(|config| config.auto_download = false).await;
        let attachment = attach(&fx, 100, &[(7, 4)]).await.remove(0);
        let outcome = fx
            .pipeline
            .process(attachment, location(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Queued);
        assert_eq!(fx.source.total_opens(), 0);
    }
}
