use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    Attachment, AttachmentStatus, Channel, Checkpoint, CheckpointKey, Community, Embed, Member,
    MemberKey, Message, Reaction, ReactionKey, Role, User,
};
use crate::snowflake::Snowflake;

#[async_trait]
pub trait CommunityStore: Send + Sync {
    async fn get_community(&self, id: Snowflake) -> Result<Option<Community>, DatabaseError>;
    async fn insert_community(&self, community: &Community) -> Result<(), DatabaseError>;
    async fn update_community(&self, community: &Community) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_channel(&self, id: Snowflake) -> Result<Option<Channel>, DatabaseError>;
    async fn insert_channel(&self, channel: &Channel) -> Result<(), DatabaseError>;
    async fn update_channel(&self, channel: &Channel) -> Result<(), DatabaseError>;
    async fn list_channels_by_community(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<Channel>, DatabaseError>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_role(&self, id: Snowflake) -> Result<Option<Role>, DatabaseError>;
    async fn insert_role(&self, role: &Role) -> Result<(), DatabaseError>;
    async fn update_role(&self, role: &Role) -> Result<(), DatabaseError>;
    async fn list_roles_by_community(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<Role>, DatabaseError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: Snowflake) -> Result<Option<User>, DatabaseError>;
    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError>;
    async fn update_user(&self, user: &User) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn get_member(&self, key: &MemberKey) -> Result<Option<Member>, DatabaseError>;
    async fn insert_member(&self, member: &Member) -> Result<(), DatabaseError>;
    async fn update_member(&self, member: &Member) -> Result<(), DatabaseError>;
    async fn list_members_by_community(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<Member>, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_message(&self, id: Snowflake) -> Result<Option<Message>, DatabaseError>;
    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError>;
    async fn update_message(&self, message: &Message) -> Result<(), DatabaseError>;
    async fn set_reference(
        &self,
        id: Snowflake,
        reference_id: Option<Snowflake>,
    ) -> Result<(), DatabaseError>;
    async fn count_messages_by_channel(&self, channel_id: Snowflake)
    -> Result<i64, DatabaseError>;
    /// Replaces the ordered embed list of a message in one transaction.
    async fn replace_embeds(
        &self,
        message_id: Snowflake,
        embeds: &[Embed],
    ) -> Result<(), DatabaseError>;
    async fn list_embeds(&self, message_id: Snowflake) -> Result<Vec<Embed>, DatabaseError>;
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn get_attachment(&self, id: Snowflake) -> Result<Option<Attachment>, DatabaseError>;
    async fn insert_attachment(&self, attachment: &Attachment) -> Result<(), DatabaseError>;
    /// Writes the upstream metadata columns only.
    async fn update_attachment_metadata(&self, attachment: &Attachment)
    -> Result<(), DatabaseError>;
    /// Writes the download-tracking columns only.
    async fn update_attachment_tracking(&self, attachment: &Attachment)
    -> Result<(), DatabaseError>;
    async fn delete_attachment(&self, id: Snowflake) -> Result<(), DatabaseError>;
    async fn list_attachments_by_message(
        &self,
        message_id: Snowflake,
    ) -> Result<Vec<Attachment>, DatabaseError>;
    /// Another completed attachment with the same content hash, if any.
    async fn find_cached_by_hash(
        &self,
        hash: &str,
        exclude_id: Snowflake,
    ) -> Result<Option<Attachment>, DatabaseError>;
    /// Oldest first by last update.
    async fn list_by_status(
        &self,
        statuses: &[AttachmentStatus],
        limit: i64,
    ) -> Result<Vec<Attachment>, DatabaseError>;
    /// Queued and pending records, plus retryable failures under the attempt ceiling.
    async fn list_awaiting_download(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> Result<Vec<Attachment>, DatabaseError>;
    async fn list_stale_in_progress(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DatabaseError>;
    async fn list_cached(&self) -> Result<Vec<Attachment>, DatabaseError>;
    async fn list_local_paths(&self) -> Result<HashSet<String>, DatabaseError>;
    async fn count_by_status(&self) -> Result<Vec<(AttachmentStatus, i64)>, DatabaseError>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    async fn get_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>, DatabaseError>;
    async fn insert_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError>;
    async fn update_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError>;
    async fn delete_reaction(&self, key: &ReactionKey) -> Result<(), DatabaseError>;
    async fn list_reactions_by_message(
        &self,
        message_id: Snowflake,
    ) -> Result<Vec<Reaction>, DatabaseError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, key: &CheckpointKey)
    -> Result<Option<Checkpoint>, DatabaseError>;
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError>;
    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError>;
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, DatabaseError>;
}
