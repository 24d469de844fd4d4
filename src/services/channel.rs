use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::create_or_replace;
use crate::db::{Channel, ChannelStore, CommunityStore};
use crate::snowflake::Snowflake;
use crate::upstream::ChannelDto;
use crate::utils::SyncError;

pub struct ChannelService {
    channels: Arc<dyn ChannelStore>,
    communities: Arc<dyn CommunityStore>,
}

impl ChannelService {
    pub fn new(channels: Arc<dyn ChannelStore>, communities: Arc<dyn CommunityStore>) -> Self {
        Self {
            channels,
            communities,
        }
    }

    /// Stores the channel; its community and parent must already be present.
    pub async fn upsert(&self, dto: &ChannelDto) -> Result<Channel, SyncError> {
        if self.communities.get_community(dto.community_id).await?.is_none() {
            return Err(SyncError::not_found("community", dto.community_id));
        }
        if let Some(parent_id) = dto.parent_id {
            if self.channels.get_channel(parent_id).await?.is_none() {
                return Err(SyncError::not_found("parent channel", parent_id));
            }
        }

        if let Some(mut channel) = self.channels.get_channel(dto.id).await? {
            apply(&mut channel, dto);
            self.channels.update_channel(&channel).await?;
            debug!("updated channel {} ({})", channel.id, channel.name);
            return Ok(channel);
        }

        let mut channel = Channel {
            id: dto.id,
            community_id: dto.community_id,
            parent_id: None,
            kind: dto.kind,
            name: String::new(),
            topic: None,
            position: 0,
            nsfw: false,
            flags: 0,
            created_at: dto.id.created_at(),
            last_synced_at: None,
        };
        apply(&mut channel, dto);
        create_or_replace(self.channels.insert_channel(&channel), || {
            self.channels.update_channel(&channel)
        })
        .await?;
        info!(
            "created channel {} ({}) in community {}",
            channel.id, channel.name, channel.community_id
        );
        Ok(channel)
    }

    pub async fn get(&self, id: Snowflake) -> Result<Option<Channel>, SyncError> {
        Ok(self.channels.get_channel(id).await?)
    }

    pub async fn list(&self, community_id: Snowflake) -> Result<Vec<Channel>, SyncError> {
        Ok(self.channels.list_channels_by_community(community_id).await?)
    }

    pub async fn mark_synced(&self, id: Snowflake) -> Result<(), SyncError> {
        let mut channel = self
            .channels
            .get_channel(id)
            .await?
            .ok_or_else(|| SyncError::not_found("channel", id))?;
        channel.last_synced_at = Some(Utc::now());
        self.channels.update_channel(&channel).await?;
        Ok(())
    }
}

fn apply(channel: &mut Channel, dto: &ChannelDto) {
    channel.community_id = dto.community_id;
    channel.parent_id = dto.parent_id;
    channel.kind = dto.kind;
    channel.name = dto.name.clone();
    channel.topic = dto.topic.clone();
    channel.position = dto.position;
    channel.nsfw = dto.nsfw;
    channel.flags = dto.flags;
}

/// Orders channels so every parent precedes its children, then by position.
///
/// Parents that are not part of the listing count as roots; a parent cycle
/// is broken by capping the walk at the listing size.
pub fn order_for_sync(channels: Vec<ChannelDto>) -> Vec<ChannelDto> {
    let parents: HashMap<Snowflake, Option<Snowflake>> = channels
        .iter()
        .map(|channel| (channel.id, channel.parent_id))
        .collect();

    let depth = |id: Snowflake| -> usize {
        let mut depth = 0;
        let mut current = parents.get(&id).copied().flatten();
        while let Some(parent) = current {
            if depth >= parents.len() {
                break;
            }
            match parents.get(&parent) {
                Some(next) => {
                    depth += 1;
                    current = *next;
                }
                None => break,
            }
        }
        depth
    };

    let mut keyed: Vec<(usize, ChannelDto)> = channels
        .into_iter()
        .map(|channel| (depth(channel.id), channel))
        .collect();
    keyed.sort_by(|(da, a), (db, b)| {
        da.cmp(db)
            .then(a.position.cmp(&b.position))
            .then(a.id.cmp(&b.id))
    });
    keyed.into_iter().map(|(_, channel)| channel).collect()
}
