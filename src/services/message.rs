use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::create_or_replace;
use super::{AttachmentService, UserService};
use crate::db::{Attachment, ChannelStore, Embed, Message, MessageStore};
use crate::snowflake::Snowflake;
use crate::upstream::MessageDto;
use crate::utils::SyncError;

/// How a reply's reference is handled when the message is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceMode {
    /// Leave the reference empty and report it; history sync resolves it
    /// once every page of the channel is stored.
    Deferred,
    /// Link now if the target is already stored, otherwise leave it empty.
    Immediate,
}

#[derive(Debug, Clone)]
pub struct MessageUpsert {
    pub message: Message,
    pub attachments: Vec<Attachment>,
    pub created: bool,
    /// Referenced message id still waiting to be linked.
    pub pending_reference: Option<Snowflake>,
}

pub struct MessageService {
    messages: Arc<dyn MessageStore>,
    channels: Arc<dyn ChannelStore>,
    users: Arc<UserService>,
    attachments: Arc<AttachmentService>,
}

impl MessageService {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        channels: Arc<dyn ChannelStore>,
        users: Arc<UserService>,
        attachments: Arc<AttachmentService>,
    ) -> Self {
        Self {
            messages,
            channels,
            users,
            attachments,
        }
    }

    /// Writes the message with its author, embeds and attachment set.
    pub async fn upsert(
        &self,
        dto: &MessageDto,
        mode: ReferenceMode,
    ) -> Result<MessageUpsert, SyncError> {
        if self.channels.get_channel(dto.channel_id).await?.is_none() {
            return Err(SyncError::not_found("channel", dto.channel_id));
        }
        self.users.upsert(&dto.author).await?;

        let (reference_id, pending_reference) = match (mode, dto.referenced_id()) {
            (_, None) => (None, None),
            (ReferenceMode::Deferred, Some(target)) => (None, Some(target)),
            (ReferenceMode::Immediate, Some(target)) => {
                if self.messages.get_message(target).await?.is_some() {
                    (Some(target), None)
                } else {
                    debug!(
                        "message {} replies to {} which is not mirrored",
                        dto.id, target
                    );
                    (None, None)
                }
            }
        };

        let existing = self.messages.get_message(dto.id).await?;
        let message = Message {
            id: dto.id,
            channel_id: dto.channel_id,
            author_id: dto.author.id,
            content: dto.content.clone(),
            kind: dto.kind,
            pinned: dto.pinned,
            tts: dto.tts,
            timestamp: dto.timestamp,
            edited_at: dto.edited_at,
            // A deferred write must not wipe a link resolved by an earlier pass.
            reference_id: match (mode, &existing) {
                (ReferenceMode::Deferred, Some(prev)) if prev.reference_id == pending_reference => {
                    prev.reference_id
                }
                _ => reference_id,
            },
        };
        let created = existing.is_none();
        if created {
            create_or_replace(self.messages.insert_message(&message), || {
                self.messages.update_message(&message)
            })
            .await?;
        } else {
            self.messages.update_message(&message).await?;
        }

        let embeds = extract_embeds(dto.id, &dto.embeds);
        self.messages.replace_embeds(dto.id, &embeds).await?;

        let attachments = self
            .attachments
            .replace_for_message(dto.id, &dto.attachments)
            .await?;

        let pending_reference = pending_reference.filter(|_| message.reference_id.is_none());
        Ok(MessageUpsert {
            message,
            attachments,
            created,
            pending_reference,
        })
    }

    /// Links `message_id` to `target` when the target is stored.
    pub async fn resolve_reference(
        &self,
        message_id: Snowflake,
        target: Snowflake,
    ) -> Result<bool, SyncError> {
        if self.messages.get_message(target).await?.is_none() {
            return Ok(false);
        }
        match self.messages.set_reference(message_id, Some(target)).await {
            Ok(()) => Ok(true),
            Err(crate::db::DatabaseError::NotFound(_)) => {
                warn!("cannot link reply {}: message is gone", message_id);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, id: Snowflake) -> Result<Option<Message>, SyncError> {
        Ok(self.messages.get_message(id).await?)
    }

    pub async fn embeds(&self, id: Snowflake) -> Result<Vec<Embed>, SyncError> {
        Ok(self.messages.list_embeds(id).await?)
    }

    pub async fn count(&self, channel_id: Snowflake) -> Result<i64, SyncError> {
        Ok(self.messages.count_messages_by_channel(channel_id).await?)
    }
}

fn extract_embeds(message_id: Snowflake, raw: &[Value]) -> Vec<Embed> {
    let text = |value: &Value, field: &str| value.get(field).and_then(Value::as_str).map(String::from);
    raw.iter()
        .enumerate()
        .map(|(position, value)| Embed {
            message_id,
            position: position as i32,
            kind: text(value, "type"),
            title: text(value, "title"),
            description: text(value, "description"),
            url: text(value, "url"),
            color: value
                .get("color")
                .and_then(Value::as_i64)
                .and_then(|color| i32::try_from(color).ok()),
            payload: value.to_string(),
        })
        .collect()
}
