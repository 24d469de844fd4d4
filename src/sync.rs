use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attachments::{AttachmentPipeline, DownloadOutcome, StorageLocation};
use crate::config::SyncConfig;
use crate::db::{Attachment, Channel, CheckpointKey, EmoteKey};
use crate::notify::{Notifier, SyncEvent};
use crate::services::channel::order_for_sync;
use crate::services::{ReactionSnapshot, ReferenceMode, Services};
use crate::snowflake::Snowflake;
use crate::upstream::{EmojiDto, MessageDto, UpstreamSource, UserDto};
use crate::utils::SyncError;

pub mod checkpoint;
pub mod history;
pub mod pacer;

pub use self::checkpoint::CheckpointTracker;
pub use self::history::HistoryPager;
pub use self::pacer::Pacer;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub message_batch_size: u32,
    pub max_messages_per_channel: usize,
    pub request_delay: Duration,
    pub member_page_size: u32,
    pub reaction_page_size: u32,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            message_batch_size: config.message_batch_size,
            max_messages_per_channel: config.max_messages_per_channel,
            request_delay: Duration::from_millis(config.request_delay_ms),
            member_page_size: config.member_page_size,
            reaction_page_size: config.reaction_page_size,
        }
    }
}

/// Counters for one community sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub community_id: Snowflake,
    pub paused: bool,
    pub roles: usize,
    pub roles_failed: usize,
    pub channels_synced: usize,
    pub channels_failed: usize,
    pub channels_skipped: usize,
    pub members_synced: usize,
    pub members_failed: usize,
    pub messages: usize,
    pub reactions: usize,
    pub reactions_failed: usize,
    pub attachments_downloaded: usize,
    pub attachments_deduplicated: usize,
    pub attachments_queued: usize,
    pub attachments_skipped: usize,
    pub attachments_failed: usize,
    pub references_resolved: usize,
    pub references_unresolved: usize,
}

impl SyncReport {
    fn new(community_id: Snowflake) -> Self {
        Self {
            community_id,
            paused: false,
            roles: 0,
            roles_failed: 0,
            channels_synced: 0,
            channels_failed: 0,
            channels_skipped: 0,
            members_synced: 0,
            members_failed: 0,
            messages: 0,
            reactions: 0,
            reactions_failed: 0,
            attachments_downloaded: 0,
            attachments_deduplicated: 0,
            attachments_queued: 0,
            attachments_skipped: 0,
            attachments_failed: 0,
            references_resolved: 0,
            references_unresolved: 0,
        }
    }

    fn record_download(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Downloaded { .. } => self.attachments_downloaded += 1,
            DownloadOutcome::Deduplicated | DownloadOutcome::AlreadyCached => {
                self.attachments_deduplicated += 1
            }
            DownloadOutcome::Queued => self.attachments_queued += 1,
            DownloadOutcome::Skipped(_) => self.attachments_skipped += 1,
            DownloadOutcome::Failed { .. } => self.attachments_failed += 1,
        }
    }
}

/// Per-run state shared by the phases.
struct Run {
    community_id: Snowflake,
    pacer: Arc<Pacer>,
    report: SyncReport,
    pending_references: Vec<(Snowflake, Snowflake)>,
    downloads: JoinSet<Result<DownloadOutcome, SyncError>>,
}

/// Runs full historical syncs of communities.
///
/// Phases run in dependency order: metadata, roles, channels (parents
/// first), members, then per-channel history with reactions. Reply links are
/// resolved once every channel is stored. Attachment downloads run beside
/// the phases and are awaited before the run completes.
pub struct SyncCoordinator {
    upstream: Arc<dyn UpstreamSource>,
    services: Services,
    checkpoints: CheckpointTracker,
    pipeline: Arc<AttachmentPipeline>,
    notifier: Notifier,
    settings: SyncSettings,
}

impl SyncCoordinator {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        services: Services,
        checkpoints: CheckpointTracker,
        pipeline: Arc<AttachmentPipeline>,
        notifier: Notifier,
        settings: SyncSettings,
    ) -> Self {
        Self {
            upstream,
            services,
            checkpoints,
            pipeline,
            notifier,
            settings,
        }
    }

    /// Syncs several communities concurrently; each has its own outcome.
    pub async fn sync_communities(
        &self,
        community_ids: &[Snowflake],
        cancel: &CancellationToken,
    ) -> Vec<(Snowflake, Result<SyncReport, SyncError>)> {
        let runs = community_ids.iter().map(|id| async move {
            (*id, self.sync_community(*id, cancel).await)
        });
        futures::future::join_all(runs).await
    }

    pub async fn sync_community(
        &self,
        community_id: Snowflake,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let key = CheckpointKey::community(community_id);
        if self.checkpoints.get_or_create(key).await?.is_paused() {
            info!("community {} is paused, skipping sync", community_id);
            let mut report = SyncReport::new(community_id);
            report.paused = true;
            return Ok(report);
        }
        self.checkpoints.start_sync(key).await?;
        info!("starting sync of community {}", community_id);

        let mut run = Run {
            community_id,
            pacer: Arc::new(Pacer::new(self.settings.request_delay)),
            report: SyncReport::new(community_id),
            pending_references: Vec::new(),
            downloads: JoinSet::new(),
        };
        let phases = self.run_phases(&mut run, cancel).await;
        let drained = self.drain_downloads(&mut run).await;
        let result = phases.and(drained);

        match result {
            Ok(()) => {
                self.checkpoints.complete_sync(key, None).await?;
                self.services.communities.mark_synced(community_id).await?;
                info!(
                    "community {} synced: {} channel(s), {} failed, {} member(s), {} message(s)",
                    community_id,
                    run.report.channels_synced,
                    run.report.channels_failed,
                    run.report.members_synced,
                    run.report.messages
                );
                self.notifier
                    .publish(SyncEvent::CommunitySynced {
                        community_id,
                        channels: run.report.channels_synced,
                        messages: run.report.messages,
                    })
                    .await;
                Ok(run.report)
            }
            Err(SyncError::Cancelled) => {
                info!(
                    "sync of community {} cancelled, checkpoint left in progress",
                    community_id
                );
                Err(SyncError::Cancelled)
            }
            Err(err) => {
                error!("sync of community {} failed: {}", community_id, err);
                if let Err(record_err) = self.checkpoints.fail_sync(key, &err.to_string()).await {
                    warn!("could not record failure of {}: {}", key, record_err);
                }
                self.notifier
                    .sync_error(Some(community_id), "community", community_id, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn run_phases(&self, run: &mut Run, cancel: &CancellationToken) -> Result<(), SyncError> {
        let community_id = run.community_id;

        run.pacer.wait().await;
        let community = self.upstream.fetch_community(community_id).await?;
        self.services.communities.upsert(&community).await?;
        ensure_active(cancel)?;

        self.sync_roles(run).await?;
        ensure_active(cancel)?;

        let channels = self.sync_channels(run).await?;
        ensure_active(cancel)?;

        self.sync_members(run, cancel).await?;

        for channel in channels.iter().filter(|c| c.kind.holds_messages()) {
            ensure_active(cancel)?;
            let key = CheckpointKey::channel(channel.id);
            let checkpoint = self.checkpoints.get_or_create(key).await?;
            if checkpoint.is_paused() {
                debug!("channel {} is paused, skipping", channel.id);
                run.report.channels_skipped += 1;
                continue;
            }

            match self.sync_channel(run, channel, checkpoint.cursor, cancel).await {
                Ok(messages) => {
                    run.report.channels_synced += 1;
                    run.report.messages += messages;
                    self.notifier
                        .publish(SyncEvent::ChannelSynced {
                            community_id,
                            channel_id: channel.id,
                            messages,
                        })
                        .await;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    run.report.channels_failed += 1;
                    self.checkpoints.fail_sync(key, &err.to_string()).await?;
                    self.notifier
                        .sync_error(Some(community_id), "channel", channel.id, &err)
                        .await;
                }
            }
        }

        self.resolve_references(run, cancel).await
    }

    async fn sync_roles(&self, run: &mut Run) -> Result<(), SyncError> {
        run.pacer.wait().await;
        let roles = self.upstream.fetch_roles(run.community_id).await?;
        for role in &roles {
            match self.services.roles.upsert(run.community_id, role).await {
                Ok(_) => run.report.roles += 1,
                Err(err) => {
                    warn!("failed to store role {}: {}", role.id, err);
                    run.report.roles_failed += 1;
                    self.notifier
                        .sync_error(Some(run.community_id), "role", role.id, &err)
                        .await;
                }
            }
        }
        debug!("stored {} role(s) for community {}", run.report.roles, run.community_id);
        Ok(())
    }

    async fn sync_channels(&self, run: &mut Run) -> Result<Vec<Channel>, SyncError> {
        run.pacer.wait().await;
        let listing = self.upstream.fetch_channels(run.community_id).await?;
        let mut stored = Vec::with_capacity(listing.len());
        for dto in order_for_sync(listing) {
            match self.services.channels.upsert(&dto).await {
                Ok(channel) => stored.push(channel),
                Err(err) => {
                    warn!("failed to store channel {}: {}", dto.id, err);
                    run.report.channels_failed += 1;
                    self.notifier
                        .sync_error(Some(run.community_id), "channel", dto.id, &err)
                        .await;
                }
            }
        }
        Ok(stored)
    }

    async fn sync_members(&self, run: &mut Run, cancel: &CancellationToken) -> Result<(), SyncError> {
        let page_size = self.settings.member_page_size.max(1);
        let mut after = None;
        loop {
            ensure_active(cancel)?;
            run.pacer.wait().await;
            let page = match self
                .upstream
                .fetch_members(run.community_id, after, page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        "member listing of community {} stopped: {}",
                        run.community_id, err
                    );
                    self.notifier
                        .sync_error(Some(run.community_id), "members", run.community_id, &err)
                        .await;
                    return Ok(());
                }
            };
            let Some(last) = page.last().map(|member| member.user.id) else {
                return Ok(());
            };

            for member in &page {
                match self.services.members.upsert(run.community_id, member).await {
                    Ok(_) => run.report.members_synced += 1,
                    Err(err) => {
                        warn!("failed to store member {}: {}", member.user.id, err);
                        run.report.members_failed += 1;
                        self.notifier
                            .sync_error(Some(run.community_id), "member", member.user.id, &err)
                            .await;
                    }
                }
            }

            if page.len() < page_size as usize {
                return Ok(());
            }
            after = Some(last);
        }
    }

    /// Stores the channel's history newer than `cursor` and advances the
    /// channel checkpoint. Any message write failure fails the channel.
    async fn sync_channel(
        &self,
        run: &mut Run,
        channel: &Channel,
        cursor: Option<Snowflake>,
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        let key = CheckpointKey::channel(channel.id);
        self.checkpoints.start_sync(key).await?;
        debug!("syncing channel {} from cursor {:?}", channel.id, cursor);

        let mut pager = HistoryPager::new(
            self.upstream.clone(),
            run.pacer.clone(),
            channel.id,
            cursor,
            self.settings.message_batch_size,
            self.settings.max_messages_per_channel,
        );

        let mut stored = 0;
        loop {
            ensure_active(cancel)?;
            let Some(batch) = pager.next_batch().await? else {
                break;
            };
            for dto in &batch {
                let written = self.services.messages.upsert(dto, ReferenceMode::Deferred).await?;
                if let Some(target) = written.pending_reference {
                    run.pending_references.push((dto.id, target));
                }
                let location = StorageLocation {
                    community_id: run.community_id,
                    channel_id: channel.id,
                    message_id: dto.id,
                };
                self.queue_downloads(run, written.attachments, location, cancel);
                stored += 1;
            }
            self.sync_reactions(run, channel.id, &batch, cancel).await?;

            self.notifier
                .publish(SyncEvent::SyncProgress {
                    community_id: run.community_id,
                    channel_id: channel.id,
                    messages_synced: pager.fetched(),
                })
                .await;
        }

        self.checkpoints.complete_sync(key, pager.newest()).await?;
        self.services.channels.mark_synced(channel.id).await?;
        debug!("channel {} synced, {} message(s)", channel.id, stored);
        Ok(stored)
    }

    /// Replaces each message's reactions with the upstream snapshot.
    async fn sync_reactions(
        &self,
        run: &mut Run,
        channel_id: Snowflake,
        batch: &[MessageDto],
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        for message in batch {
            let present: Vec<EmoteKey> = message
                .reactions
                .iter()
                .filter_map(|summary| summary.emoji.key().ok())
                .collect();

            let mut snapshots = Vec::with_capacity(message.reactions.len());
            for summary in &message.reactions {
                let emote = match summary.emoji.key() {
                    Ok(emote) => emote,
                    Err(err) => {
                        warn!("ignoring reaction on message {}: {}", message.id, err);
                        run.report.reactions_failed += 1;
                        continue;
                    }
                };
                match self
                    .fetch_reactors(run, channel_id, message.id, &summary.emoji, cancel)
                    .await
                {
                    Ok(users) => {
                        for user in &users {
                            if let Err(err) = self.services.users.upsert(user).await {
                                debug!("could not store reacting user {}: {}", user.id, err);
                            }
                        }
                        snapshots.push(ReactionSnapshot {
                            emote,
                            emote_name: summary.emoji.display_name(),
                            user_ids: users.iter().map(|user| user.id).collect(),
                        });
                    }
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(err) => {
                        warn!(
                            "failed to list {} reactions on message {}: {}",
                            emote, message.id, err
                        );
                        run.report.reactions_failed += 1;
                        self.notifier
                            .sync_error(
                                Some(run.community_id),
                                "reaction",
                                format!("{}:{}", message.id, emote),
                                &err,
                            )
                            .await;
                    }
                }
            }

            match self
                .services
                .reactions
                .replace_snapshot(message.id, &present, snapshots)
                .await
            {
                Ok(stored) => run.report.reactions += stored,
                Err(err) => {
                    warn!("failed to store reactions of message {}: {}", message.id, err);
                    run.report.reactions_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn fetch_reactors(
        &self,
        run: &Run,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &EmojiDto,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserDto>, SyncError> {
        let page_size = self.settings.reaction_page_size.max(1);
        let mut users: Vec<UserDto> = Vec::new();
        let mut after = None;
        loop {
            ensure_active(cancel)?;
            run.pacer.wait().await;
            let page = self
                .upstream
                .fetch_reaction_users(channel_id, message_id, emoji, after, page_size)
                .await?;
            let full = page.len() >= page_size as usize;
            after = page.last().map(|user| user.id);
            users.extend(page);
            if !full || after.is_none() {
                return Ok(users);
            }
        }
    }

    fn queue_downloads(
        &self,
        run: &mut Run,
        attachments: Vec<Attachment>,
        location: StorageLocation,
        cancel: &CancellationToken,
    ) {
        for attachment in attachments {
            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            run.downloads
                .spawn(async move { pipeline.process(attachment, location, &cancel).await });
        }
    }

    async fn drain_downloads(&self, run: &mut Run) -> Result<(), SyncError> {
        let mut cancelled = false;
        while let Some(joined) = run.downloads.join_next().await {
            match joined {
                Ok(Ok(outcome)) => run.report.record_download(&outcome),
                Ok(Err(SyncError::Cancelled)) => cancelled = true,
                Ok(Err(err)) => {
                    warn!("attachment download aborted: {}", err);
                    run.report.attachments_failed += 1;
                }
                Err(err) => {
                    error!("download task panicked: {}", err);
                    run.report.attachments_failed += 1;
                }
            }
        }
        if cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Links replies whose target was stored during this run.
    async fn resolve_references(
        &self,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let pending = std::mem::take(&mut run.pending_references);
        for (message_id, target) in pending {
            ensure_active(cancel)?;
            match self.services.messages.resolve_reference(message_id, target).await {
                Ok(true) => run.report.references_resolved += 1,
                Ok(false) => run.report.references_unresolved += 1,
                Err(err) => {
                    warn!("failed to link reply {} to {}: {}", message_id, target, err);
                    run.report.references_unresolved += 1;
                }
            }
        }
        if run.report.references_unresolved > 0 {
            debug!(
                "{} reply reference(s) point outside the mirror",
                run.report.references_unresolved
            );
        }
        Ok(())
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}
