use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{ChannelKind, EmoteKey, MessageKind};
use crate::snowflake::Snowflake;
use crate::utils::SyncError;

pub mod http;

pub use self::http::HttpUpstream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityDto {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDto {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub color: i32,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub mentionable: bool,
    #[serde(default)]
    pub managed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDto {
    pub id: Snowflake,
    #[serde(alias = "guild_id")]
    pub community_id: Snowflake,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub flags: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDto {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDto {
    pub user: UserDto,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDto {
    pub id: Snowflake,
    pub filename: String,
    #[serde(default)]
    pub size: i64,
    pub url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmojiDto {
    #[serde(default)]
    pub id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
}

impl EmojiDto {
    pub fn key(&self) -> Result<EmoteKey, SyncError> {
        match (self.id, self.name.as_deref()) {
            (Some(id), _) => Ok(EmoteKey::Custom(id)),
            (None, Some(name)) if !name.is_empty() => Ok(EmoteKey::Unicode(name.to_string())),
            _ => Err(SyncError::Validation(
                "emoji has neither an id nor a name".to_string(),
            )),
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSummaryDto {
    #[serde(default)]
    pub count: i64,
    pub emoji: EmojiDto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReferenceDto {
    #[serde(default)]
    pub message_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub author: UserDto,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub tts: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "edited_timestamp")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_reference: Option<MessageReferenceDto>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDto>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub reactions: Vec<ReactionSummaryDto>,
}

impl MessageDto {
    pub fn referenced_id(&self) -> Option<Snowflake> {
        self.message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
    }
}

/// Read capabilities of the upstream service. Every call is side-effect free.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch_community(&self, community_id: Snowflake) -> Result<CommunityDto, SyncError>;

    async fn fetch_roles(&self, community_id: Snowflake) -> Result<Vec<RoleDto>, SyncError>;

    /// Channels plus the community's active threads.
    async fn fetch_channels(&self, community_id: Snowflake)
    -> Result<Vec<ChannelDto>, SyncError>;

    /// Members with user ids strictly greater than `after`, ascending.
    async fn fetch_members(
        &self,
        community_id: Snowflake,
        after: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<MemberDto>, SyncError>;

    /// Messages with ids strictly less than `before`, newest first.
    async fn fetch_messages(
        &self,
        channel_id: Snowflake,
        before: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<MessageDto>, SyncError>;

    /// Users who reacted with `emoji`, ids strictly greater than `after`.
    async fn fetch_reaction_users(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &EmojiDto,
        after: Option<Snowflake>,
        limit: u32,
    ) -> Result<Vec<UserDto>, SyncError>;
}
