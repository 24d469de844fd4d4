//! Shared fixtures for unit tests: a throwaway database, in-memory upstream
//! and CDN doubles, and a recording event publisher.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::attachments::{FileSource, FileStream};
use crate::db::{ChannelKind, DatabaseManager, EmoteKey, MessageKind};
use crate::notify::{EventPublisher, SyncEvent};
use crate::snowflake::Snowflake;
use crate::upstream::{
    AttachmentDto, ChannelDto, CommunityDto, EmojiDto, MemberDto, MessageDto,
    MessageReferenceDto, ReactionSummaryDto, RoleDto, UpstreamSource, UserDto,
};
use crate::utils::SyncError;

pub struct TestDb {
    pub dir: TempDir,
    pub manager: DatabaseManager,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        let manager = DatabaseManager::open(path.to_str().unwrap(), 4, 5_000).unwrap();
        manager.migrate().await.unwrap();
        Self { dir, manager }
    }
}

pub fn sf(id: u64) -> Snowflake {
    Snowflake::new(id)
}

pub fn community_dto(id: u64) -> CommunityDto {
    CommunityDto {
        id: sf(id),
        name: format!("community-{id}"),
        owner_id: Some(sf(1)),
        icon: None,
        description: None,
    }
}

pub fn role_dto(id: u64, position: i32) -> RoleDto {
    RoleDto {
        id: sf(id),
        name: format!("role-{id}"),
        color: 0,
        position,
        permissions: "2048".to_string(),
        hoist: false,
        mentionable: true,
        managed: false,
    }
}

pub fn channel_dto(id: u64, community: u64, parent: Option<u64>, kind: ChannelKind) -> ChannelDto {
    ChannelDto {
        id: sf(id),
        community_id: sf(community),
        parent_id: parent.map(sf),
        kind,
        name: format!("channel-{id}"),
        topic: None,
        position: 0,
        nsfw: false,
        flags: 0,
    }
}

pub fn user_dto(id: u64) -> UserDto {
    UserDto {
        id: sf(id),
        username: format!("user{id}"),
        global_name: None,
        avatar: None,
        bot: false,
    }
}

pub fn member_dto(user: u64) -> MemberDto {
    MemberDto {
        user: user_dto(user),
        nick: None,
        joined_at: Some(Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap()),
        roles: Vec::new(),
        pending: false,
    }
}

pub fn message_dto(id: u64, channel: u64, author: u64) -> MessageDto {
    MessageDto {
        id: sf(id),
        channel_id: sf(channel),
        author: user_dto(author),
        content: format!("message {id}"),
        kind: MessageKind::Default,
        pinned: false,
        tts: false,
        timestamp: sf(id).created_at(),
        edited_at: None,
        message_reference: None,
        attachments: Vec::new(),
        embeds: Vec::new(),
        reactions: Vec::new(),
    }
}

pub fn reply_dto(id: u64, channel: u64, author: u64, target: u64) -> MessageDto {
    let mut dto = message_dto(id, channel, author);
    dto.kind = MessageKind::Reply;
    dto.message_reference = Some(MessageReferenceDto {
        message_id: Some(sf(target)),
    });
    dto
}

pub fn attachment_dto(id: u64, size: i64) -> AttachmentDto {
    AttachmentDto {
        id: sf(id),
        filename: format!("file-{id}.png"),
        size,
        url: format!("https://cdn.test/{id}/file-{id}.png"),
        proxy_url: None,
        content_type: Some("image/png".to_string()),
        width: Some(16),
        height: Some(16),
    }
}

pub fn unicode_reaction(name: &str, count: i64) -> ReactionSummaryDto {
    ReactionSummaryDto {
        count,
        emoji: EmojiDto {
            id: None,
            name: Some(name.to_string()),
        },
    }
}

/// Seeds a community, one text channel and its author so messages can be stored.
pub async fn seed_channel(db: &TestDb, community: u64, channel: u64) {
    let services = crate::services::Services::new(&db.manager);
    services.communities.upsert(&community_dto(community)).await.unwrap();
    services
        .channels
        .upsert(&channel_dto(channel, community, None, ChannelKind::Text))
        .await
        .unwrap();
}

/// In-memory upstream following the paging contracts of the real API.
#[derive(Default)]
pub struct FakeUpstream {
    pub community: Mutex<Option<CommunityDto>>,
    pub roles: Mutex<Vec<RoleDto>>,
    pub channels: Mutex<Vec<ChannelDto>>,
    pub members: Mutex<Vec<MemberDto>>,
    pub messages: Mutex<HashMap<Snowflake, Vec<MessageDto>>>,
    pub reaction_users: Mutex<HashMap<(Snowflake, EmoteKey), Vec<UserDto>>>,
    pub failing_channels: Mutex<HashSet<Snowflake>>,
    pub fail_roles: Mutex<bool>,
    /// `(channel, before, limit)` for every message fetch.
    pub message_calls: Mutex<Vec<(Snowflake, Option<Snowflake>, u32)>>,
    pub member_calls: Mutex<Vec<Option<Snowflake>>>,
    /// Cancels the token once this many message fetches have been served.
    pub cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeUpstream {
    pub fn with_community(id: u64) -> Self {
        let upstream = Self::default();
        *upstream.community.lock() = Some(community_dto(id));
        upstream
    }

    pub fn add_channel(&self, channel: ChannelDto) {
        self.channels.lock().push(channel);
    }

    pub fn add_messages(&self, channel: u64, messages: impl IntoIterator<Item = MessageDto>) {
        self.messages
            .lock()
            .entry(sf(channel))
            .or_default()
            .extend(messages);
    }

    pub fn add_reaction_users(&self, message: u64, emote: EmoteKey, users: &[u64]) {
        self.reaction_users
            .lock()
            .entry((sf(message), emote))
            .or_default()
            .extend(users.iter().map(|id| user_dto(*id)));
    }

    pub fn message_calls_for(&self, channel: u64) -> Vec<(Option<Snowflake>, u32)> {
        self.message_calls
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == sf(channel))
            .map(|(_, before, limit)| (*before, *limit))
            .collect()
    }
}

#[async_trait]
impl UpstreamSource for FakeUpstream {
    async fn fetch_community(&self, community_id: Snowflake) -> Result<CommunityDto, SyncError> {
        self.community
            .lock()
            .clone()
            .filter(|community| community.id == community_id)
            .ok_or_else(|| SyncError::not_found("upstream resource", community_id))
    }

    async fn fetch_roles(&self, _community_id: Snowflake) -> Result<Vec<RoleDto>, SyncError> {
        if *self.fail_roles.lock() {
            return Err(SyncError::PermanentIo("roles unavailable".to_string()));
        }
        Ok(self.roles.lock().clone())
    }

    async fn fetch_channels(&self, community_id: Snowflake) -> Result<Vec<ChannelDto>, SyncError> {
        Ok(self
            .channels
            .lock()
            .iter()
            .filter(|channel| channel.community_id == community_id)
            .cloned()
            .collect())
    }

    async fn fetch_members(
        &self,
        _community_id: Snowflake,
        after: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<MemberDto>, SyncError> {
        self.member_calls.lock().push(after);
        let mut members: Vec<MemberDto> = self
            .members
            .lock()
            .iter()
            .filter(|member| after.is_none_or(|after| member.user.id > after))
            .cloned()
            .collect();
        members.sort_by_key(|member| member.user.id);
        members.truncate(limit as usize);
        Ok(members)
    }

    async fn fetch_messages(
        &self,
        channel_id: Snowflake,
        before: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<MessageDto>, SyncError> {
        let served = {
            let mut calls = self.message_calls.lock();
            calls.push((channel_id, before, limit));
            calls.len()
        };
        if let Some((after, token)) = self.cancel_after.lock().as_ref() {
            if served > *after {
                token.cancel();
            }
        }
        if self.failing_channels.lock().contains(&channel_id) {
            return Err(SyncError::PermanentIo(format!(
                "access denied on channel {channel_id}"
            )));
        }

        let mut messages: Vec<MessageDto> = self
            .messages
            .lock()
            .get(&channel_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| before.is_none_or(|before| message.id < before))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn fetch_reaction_users(
        &self,
        _channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &EmojiDto,
        after: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<UserDto>, SyncError> {
        let key = (message_id, emoji.key()?);
        let mut users: Vec<UserDto> = self
            .reaction_users
            .lock()
            .get(&key)
            .map(|users| {
                users
                    .iter()
                    .filter(|user| after.is_none_or(|after| user.id > after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        users.sort_by_key(|user| user.id);
        users.truncate(limit as usize);
        Ok(users)
    }
}

#[derive(Debug, Clone)]
pub enum FakeResponse {
    Body {
        bytes: Vec<u8>,
        content_type: Option<String>,
        declare_length: bool,
    },
    Transient,
    Permanent,
}

impl FakeResponse {
    pub fn png(bytes: &[u8]) -> Self {
        FakeResponse::Body {
            bytes: bytes.to_vec(),
            content_type: Some("image/png".to_string()),
            declare_length: true,
        }
    }
}

/// CDN double. Each URL replays its queued responses; the last one repeats.
#[derive(Default)]
pub struct FakeFileSource {
    responses: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl FakeFileSource {
    pub fn respond(&self, url: &str, responses: impl IntoIterator<Item = FakeResponse>) {
        self.responses
            .lock()
            .insert(url.to_string(), responses.into_iter().collect());
    }

    pub fn opens(&self, url: &str) -> usize {
        self.opens.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().values().sum()
    }
}

#[async_trait]
impl FileSource for FakeFileSource {
    async fn open(&self, url: &str) -> Result<FileStream, SyncError> {
        *self.opens.lock().entry(url.to_string()).or_default() += 1;
        let response = {
            let mut responses = self.responses.lock();
            let queue = responses
                .get_mut(url)
                .ok_or_else(|| SyncError::PermanentIo(format!("CDN URL expired: {url}")))?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match response {
            Some(FakeResponse::Body {
                bytes,
                content_type,
                declare_length,
            }) => {
                let content_length = declare_length.then_some(bytes.len() as u64);
                let chunks: Vec<Result<Bytes, SyncError>> = bytes
                    .chunks(4)
                    .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                    .collect();
                Ok(FileStream {
                    content_length,
                    content_type,
                    body: futures::stream::iter(chunks).boxed(),
                })
            }
            Some(FakeResponse::Transient) => Err(SyncError::transient("upstream error 503")),
            Some(FakeResponse::Permanent) | None => {
                Err(SyncError::PermanentIo(format!("CDN URL expired: {url}")))
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(SyncEvent::name).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &SyncEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
