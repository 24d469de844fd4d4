use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::create_or_replace;
use crate::db::{EmoteKey, MessageStore, Reaction, ReactionKey, ReactionStore};
use crate::snowflake::Snowflake;
use crate::utils::SyncError;

/// The full reacting-user set of one emote, as paged from upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSnapshot {
    pub emote: EmoteKey,
    pub emote_name: String,
    pub user_ids: BTreeSet<Snowflake>,
}

pub struct ReactionService {
    reactions: Arc<dyn ReactionStore>,
    messages: Arc<dyn MessageStore>,
}

impl ReactionService {
    pub fn new(reactions: Arc<dyn ReactionStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            reactions,
            messages,
        }
    }

    /// Adding a user twice is a no-op.
    pub async fn add_user(
        &self,
        key: ReactionKey,
        emote_name: &str,
        user_id: Snowflake,
    ) -> Result<Reaction, SyncError> {
        if self.messages.get_message(key.message_id).await?.is_none() {
            return Err(SyncError::not_found("message", key.message_id));
        }

        match self.reactions.get_reaction(&key).await? {
            Some(mut reaction) => {
                if reaction.add_user(user_id) {
                    self.reactions.update_reaction(&reaction).await?;
                }
                Ok(reaction)
            }
            None => {
                let mut reaction = Reaction::new(key, emote_name.to_string());
                reaction.add_user(user_id);
                create_or_replace(self.reactions.insert_reaction(&reaction), || {
                    self.reactions.update_reaction(&reaction)
                })
                .await?;
                Ok(reaction)
            }
        }
    }

    /// Returns the remaining aggregate, or `None` once the last user left.
    pub async fn remove_user(
        &self,
        key: &ReactionKey,
        user_id: Snowflake,
    ) -> Result<Option<Reaction>, SyncError> {
        let Some(mut reaction) = self.reactions.get_reaction(key).await? else {
            return Ok(None);
        };
        if !reaction.remove_user(user_id) {
            return Ok(Some(reaction));
        }
        if reaction.is_empty() {
            self.reactions.delete_reaction(key).await?;
            debug!("last user left reaction {} on {}", key.emote, key.message_id);
            return Ok(None);
        }
        self.reactions.update_reaction(&reaction).await?;
        Ok(Some(reaction))
    }

    /// Replaces the reactions of a message with upstream's current view.
    ///
    /// Emotes absent from `present` are deleted. Emotes listed in `present`
    /// without a snapshot (their user listing failed) keep their stored set.
    pub async fn replace_snapshot(
        &self,
        message_id: Snowflake,
        present: &[EmoteKey],
        snapshots: Vec<ReactionSnapshot>,
    ) -> Result<usize, SyncError> {
        let present: HashSet<&EmoteKey> = present.iter().collect();
        for stored in self.reactions.list_reactions_by_message(message_id).await? {
            if !present.contains(&stored.emote) {
                self.reactions.delete_reaction(&stored.key()).await?;
            }
        }

        let mut stored = 0;
        for snapshot in snapshots {
            let key = ReactionKey {
                message_id,
                emote: snapshot.emote,
            };
            if snapshot.user_ids.is_empty() {
                self.reactions.delete_reaction(&key).await?;
                continue;
            }
            let reaction = Reaction {
                message_id,
                emote: key.emote.clone(),
                emote_name: snapshot.emote_name,
                user_ids: snapshot.user_ids,
            };
            if self.reactions.get_reaction(&key).await?.is_some() {
                self.reactions.update_reaction(&reaction).await?;
            } else {
                create_or_replace(self.reactions.insert_reaction(&reaction), || {
                    self.reactions.update_reaction(&reaction)
                })
                .await?;
            }
            stored += 1;
        }
        Ok(stored)
    }

    pub async fn get(&self, key: &ReactionKey) -> Result<Option<Reaction>, SyncError> {
        Ok(self.reactions.get_reaction(key).await?)
    }

    pub async fn list(&self, message_id: Snowflake) -> Result<Vec<Reaction>, SyncError> {
        Ok(self.reactions.list_reactions_by_message(message_id).await?)
    }
}
