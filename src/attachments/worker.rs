use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AttachmentPipeline, DownloadOutcome, Reconciler, StorageLocation};
use crate::config::AttachmentConfig;
use crate::db::{Attachment, AttachmentStore, ChannelStore, MessageStore};
use crate::utils::SyncError;

/// Counts for one pass over the download queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPass {
    pub picked: usize,
    pub downloaded: usize,
    pub deduplicated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WorkerPass {
    fn record(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Downloaded { .. } => self.downloaded += 1,
            DownloadOutcome::Deduplicated | DownloadOutcome::AlreadyCached => {
                self.deduplicated += 1
            }
            DownloadOutcome::Skipped(_) => self.skipped += 1,
            DownloadOutcome::Failed { .. } => self.failed += 1,
            DownloadOutcome::Queued => {}
        }
    }
}

/// Drains the database-backed download queue: queued and pending records
/// plus retryable failures under the attempt ceiling.
pub struct DownloadWorker {
    pipeline: Arc<AttachmentPipeline>,
    attachments: Arc<dyn AttachmentStore>,
    messages: Arc<dyn MessageStore>,
    channels: Arc<dyn ChannelStore>,
    reconciler: Option<Reconciler>,
    poll_interval: Duration,
    batch_size: i64,
    stale_after: Duration,
    reconcile_interval: Duration,
}

impl DownloadWorker {
    pub fn new(
        pipeline: Arc<AttachmentPipeline>,
        attachments: Arc<dyn AttachmentStore>,
        messages: Arc<dyn MessageStore>,
        channels: Arc<dyn ChannelStore>,
        config: &AttachmentConfig,
    ) -> Self {
        Self {
            pipeline,
            attachments,
            messages,
            channels,
            reconciler: None,
            poll_interval: Duration::from_secs(config.worker_poll_interval_secs.max(1)),
            batch_size: config.worker_batch_size.max(1),
            stale_after: Duration::from_secs(config.stale_in_progress_secs),
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs),
        }
    }

    /// Runs reconciliation every `reconcile_interval_secs` alongside the queue.
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Downloads left InProgress by a crashed process are failed as retryable.
    pub async fn recover_stale(&self) -> Result<usize, SyncError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero());
        let stale = self.attachments.list_stale_in_progress(cutoff).await?;
        for mut attachment in stale.iter().cloned() {
            attachment.mark_failed("download interrupted".to_string(), true);
            self.attachments.update_attachment_tracking(&attachment).await?;
        }
        if !stale.is_empty() {
            info!("recovered {} interrupted download(s)", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<WorkerPass, SyncError> {
        let max_attempts = self.pipeline.retry_policy().max_attempts();
        let batch = self
            .attachments
            .list_awaiting_download(max_attempts, self.batch_size)
            .await?;

        let mut pass = WorkerPass {
            picked: batch.len(),
            ..WorkerPass::default()
        };
        if batch.is_empty() {
            return Ok(pass);
        }
        debug!("worker picked {} attachment(s)", batch.len());

        let mut tasks = JoinSet::new();
        for attachment in batch {
            let Some(location) = self.locate(&attachment).await? else {
                let mut orphan = attachment;
                orphan.mark_failed("message or channel is no longer mirrored".to_string(), false);
                self.attachments.update_attachment_tracking(&orphan).await?;
                pass.failed += 1;
                continue;
            };
            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { pipeline.download(attachment, location, &cancel).await });
        }

        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => pass.record(&outcome),
                Ok(Err(SyncError::Cancelled)) => cancelled = true,
                Ok(Err(err)) => {
                    warn!("attachment download aborted: {}", err);
                    pass.failed += 1;
                }
                Err(err) => {
                    error!("download task panicked: {}", err);
                    pass.failed += 1;
                }
            }
        }
        if cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(pass)
    }

    /// Polls until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        self.recover_stale().await?;
        let mut last_reconcile = tokio::time::Instant::now();
        info!("attachment worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pass = match self.run_once(&cancel).await {
                Ok(pass) => pass,
                Err(SyncError::Cancelled) => break,
                Err(err) => {
                    error!("attachment worker pass failed: {}", err);
                    WorkerPass::default()
                }
            };
            if pass.picked > 0 {
                info!(
                    "worker pass: {} downloaded, {} deduplicated, {} skipped, {} failed",
                    pass.downloaded, pass.deduplicated, pass.skipped, pass.failed
                );
            }

            if let Some(reconciler) = &self.reconciler {
                if !self.reconcile_interval.is_zero()
                    && last_reconcile.elapsed() >= self.reconcile_interval
                {
                    last_reconcile = tokio::time::Instant::now();
                    match reconciler.run(false).await {
                        Ok(report) => info!("{}", report),
                        Err(err) => error!("reconciliation failed: {}", err),
                    }
                }
            }

            // A full batch suggests more work is waiting.
            if pass.picked as i64 >= self.batch_size {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("attachment worker stopped");
        Ok(())
    }

    async fn locate(&self, attachment: &Attachment) -> Result<Option<StorageLocation>, SyncError> {
        let Some(message) = self.messages.get_message(attachment.message_id).await? else {
            return Ok(None);
        };
        let Some(channel) = self.channels.get_channel(message.channel_id).await? else {
            return Ok(None);
        };
        Ok(Some(StorageLocation {
            community_id: channel.community_id,
            channel_id: channel.id,
            message_id: message.id,
        }))
    }
}
