use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::ReactionKey;
use crate::notify::{Notifier, SyncEvent};
use crate::services::{ReferenceMode, Services};
use crate::snowflake::Snowflake;
use crate::upstream::{ChannelDto, CommunityDto, EmojiDto, MemberDto, MessageDto, RoleDto, UserDto};
use crate::utils::SyncError;

pub mod queue;

pub use self::queue::KeyedQueue;

/// A change pushed by the upstream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum UpstreamEvent {
    CommunityUpdate(CommunityDto),
    ChannelUpsert(ChannelDto),
    ChannelDelete {
        community_id: Snowflake,
        channel_id: Snowflake,
    },
    RoleUpsert {
        community_id: Snowflake,
        role: RoleDto,
    },
    RoleDelete {
        community_id: Snowflake,
        role_id: Snowflake,
    },
    MemberUpsert {
        community_id: Snowflake,
        member: MemberDto,
    },
    MemberRemove {
        community_id: Snowflake,
        user_id: Snowflake,
    },
    UserUpdate(UserDto),
    MessageCreate(MessageDto),
    MessageUpdate(MessageDto),
    MessageDelete {
        channel_id: Snowflake,
        message_id: Snowflake,
    },
    ReactionAdd {
        channel_id: Snowflake,
        message_id: Snowflake,
        user_id: Snowflake,
        emoji: EmojiDto,
    },
    ReactionRemove {
        channel_id: Snowflake,
        message_id: Snowflake,
        user_id: Snowflake,
        emoji: EmojiDto,
    },
}

impl UpstreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UpstreamEvent::CommunityUpdate(_) => "community_update",
            UpstreamEvent::ChannelUpsert(_) => "channel_upsert",
            UpstreamEvent::ChannelDelete { .. } => "channel_delete",
            UpstreamEvent::RoleUpsert { .. } => "role_upsert",
            UpstreamEvent::RoleDelete { .. } => "role_delete",
            UpstreamEvent::MemberUpsert { .. } => "member_upsert",
            UpstreamEvent::MemberRemove { .. } => "member_remove",
            UpstreamEvent::UserUpdate(_) => "user_update",
            UpstreamEvent::MessageCreate(_) => "message_create",
            UpstreamEvent::MessageUpdate(_) => "message_update",
            UpstreamEvent::MessageDelete { .. } => "message_delete",
            UpstreamEvent::ReactionAdd { .. } => "reaction_add",
            UpstreamEvent::ReactionRemove { .. } => "reaction_remove",
        }
    }

    /// Events with the same key are applied in arrival order.
    pub fn ordering_key(&self) -> String {
        match self {
            UpstreamEvent::CommunityUpdate(community) => format!("community:{}", community.id),
            UpstreamEvent::ChannelUpsert(channel) => format!("community:{}", channel.community_id),
            UpstreamEvent::ChannelDelete { community_id, .. }
            | UpstreamEvent::RoleUpsert { community_id, .. }
            | UpstreamEvent::RoleDelete { community_id, .. }
            | UpstreamEvent::MemberUpsert { community_id, .. }
            | UpstreamEvent::MemberRemove { community_id, .. } => {
                format!("community:{community_id}")
            }
            UpstreamEvent::MessageDelete { channel_id, .. }
            | UpstreamEvent::ReactionAdd { channel_id, .. }
            | UpstreamEvent::ReactionRemove { channel_id, .. } => format!("channel:{channel_id}"),
            UpstreamEvent::MessageCreate(message) | UpstreamEvent::MessageUpdate(message) => {
                format!("channel:{}", message.channel_id)
            }
            UpstreamEvent::UserUpdate(user) => format!("user:{}", user.id),
        }
    }

    /// Community and channel structure that later events in any lane may
    /// depend on, such as a parent category or the channel of a message.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            UpstreamEvent::CommunityUpdate(_)
                | UpstreamEvent::ChannelUpsert(_)
                | UpstreamEvent::ChannelDelete { .. }
        )
    }
}

/// Applies live events through the same services the historical sync uses.
/// Deletions are recorded in the log only; mirrored rows are kept.
pub struct EventHandler {
    services: Services,
    notifier: Notifier,
}

impl EventHandler {
    pub fn new(services: Services, notifier: Notifier) -> Self {
        Self { services, notifier }
    }

    pub async fn handle(&self, event: UpstreamEvent) -> Result<(), SyncError> {
        debug!("applying {} event", event.name());
        match event {
            UpstreamEvent::CommunityUpdate(community) => {
                self.services.communities.upsert(&community).await?;
            }
            UpstreamEvent::ChannelUpsert(channel) => {
                self.services.channels.upsert(&channel).await?;
            }
            UpstreamEvent::ChannelDelete {
                community_id,
                channel_id,
            } => {
                info!(
                    "channel {} deleted upstream in community {}, keeping mirror",
                    channel_id, community_id
                );
            }
            UpstreamEvent::RoleUpsert { community_id, role } => {
                self.services.roles.upsert(community_id, &role).await?;
            }
            UpstreamEvent::RoleDelete {
                community_id,
                role_id,
            } => {
                info!(
                    "role {} deleted upstream in community {}, keeping mirror",
                    role_id, community_id
                );
            }
            UpstreamEvent::MemberUpsert {
                community_id,
                member,
            } => {
                self.services.members.upsert(community_id, &member).await?;
                self.notifier
                    .publish(SyncEvent::MemberUpdated {
                        community_id,
                        user_id: member.user.id,
                    })
                    .await;
            }
            UpstreamEvent::MemberRemove {
                community_id,
                user_id,
            } => {
                info!("member {} left community {}", user_id, community_id);
            }
            UpstreamEvent::UserUpdate(user) => {
                self.services.users.upsert(&user).await?;
            }
            UpstreamEvent::MessageCreate(message) => {
                self.services
                    .messages
                    .upsert(&message, ReferenceMode::Immediate)
                    .await?;
                self.notifier
                    .publish(SyncEvent::MessageReceived {
                        channel_id: message.channel_id,
                        message_id: message.id,
                    })
                    .await;
            }
            UpstreamEvent::MessageUpdate(message) => {
                self.services
                    .messages
                    .upsert(&message, ReferenceMode::Immediate)
                    .await?;
                self.notifier
                    .publish(SyncEvent::MessageUpdated {
                        channel_id: message.channel_id,
                        message_id: message.id,
                    })
                    .await;
            }
            UpstreamEvent::MessageDelete {
                channel_id,
                message_id,
            } => {
                info!(
                    "message {} deleted upstream in channel {}, keeping mirror",
                    message_id, channel_id
                );
                self.notifier
                    .publish(SyncEvent::MessageDeleted {
                        channel_id,
                        message_id,
                    })
                    .await;
            }
            UpstreamEvent::ReactionAdd {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                let key = ReactionKey {
                    message_id,
                    emote: emoji.key()?,
                };
                self.services
                    .reactions
                    .add_user(key, &emoji.display_name(), user_id)
                    .await?;
            }
            UpstreamEvent::ReactionRemove {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                let key = ReactionKey {
                    message_id,
                    emote: emoji.key()?,
                };
                self.services.reactions.remove_user(&key, user_id).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub malformed: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Reads one JSON event per line and applies them through a keyed queue.
/// Blank lines are ignored; malformed lines are counted and skipped.
pub async fn ingest_lines<R>(
    reader: R,
    handler: Arc<EventHandler>,
    queue: &KeyedQueue,
    cancel: &CancellationToken,
) -> Result<IngestReport>
where
    R: AsyncBufRead + Unpin,
{
    let applied = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let mut report = IngestReport::default();
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("event ingestion cancelled, finishing queued events");
                break;
            }
            line = lines.next_line() => line.context("failed to read event stream")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        report.received += 1;

        let event: UpstreamEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!("skipping malformed event on line {}: {}", report.received, err);
                report.malformed += 1;
                continue;
            }
        };

        let key = event.ordering_key();
        let structural = event.is_structural();
        let job = apply_event(handler.clone(), event, applied.clone(), failed.clone());
        if structural {
            // Everything read before a structural event lands first, and
            // nothing read after it starts until it is stored.
            queue.drain().await;
            job.await;
        } else {
            queue.enqueue(&key, job);
        }
    }

    queue.drain().await;
    report.applied = applied.load(Ordering::Relaxed);
    report.failed = failed.load(Ordering::Relaxed);
    info!(
        "ingested {} event(s): {} applied, {} failed, {} malformed",
        report.received, report.applied, report.failed, report.malformed
    );
    Ok(report)
}

async fn apply_event(
    handler: Arc<EventHandler>,
    event: UpstreamEvent,
    applied: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
) {
    let name = event.name();
    match handler.handle(event).await {
        Ok(()) => {
            applied.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            warn!("failed to apply {} event: {}", name, err);
            failed.fetch_add(1, Ordering::Relaxed);
            handler.notifier.sync_error(None, "event", name, &err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::{ChannelKind, EmoteKey};
    use crate::test_support::{
        RecordingPublisher, TestDb, channel_dto, member_dto, message_dto, reply_dto, seed_channel,
        sf, user_dto,
    };

    struct Harness {
        db: TestDb,
        recorder: Arc<RecordingPublisher>,
        handler: Arc<EventHandler>,
    }

    async fn harness() -> Harness {
        let db = TestDb::new().await;
        seed_channel(&db, 1, 10).await;
        let recorder = Arc::new(RecordingPublisher::default());
        let handler = Arc::new(EventHandler::new(
            Services::new(&db.manager),
            Notifier::new(recorder.clone(), Duration::from_secs(1)),
        ));
        Harness {
            db,
            recorder,
            handler,
        }
    }

    fn reaction(message: u64, user: u64, add: bool) -> UpstreamEvent {
        let emoji = EmojiDto {
            id: None,
            name: Some("👍".to_string()),
        };
        if add {
            UpstreamEvent::ReactionAdd {
                channel_id: sf(10),
                message_id: sf(message),
                user_id: sf(user),
                emoji,
            }
        } else {
            UpstreamEvent::ReactionRemove {
                channel_id: sf(10),
                message_id: sf(message),
                user_id: sf(user),
                emoji,
            }
        }
    }

    fn thumbs_up(message: u64) -> ReactionKey {
        ReactionKey {
            message_id: sf(message),
            emote: EmoteKey::Unicode("👍".to_string()),
        }
    }

    #[test]
    fn events_decode_from_tagged_json() {
        let raw = r#"{"event": "message_delete", "data": {"channel_id": "10", "message_id": "99"}}"#;
        let event: UpstreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            UpstreamEvent::MessageDelete {
                channel_id: sf(10),
                message_id: sf(99),
            }
        );
        assert_eq!(event.ordering_key(), "channel:10");
    }

    #[test]
    fn community_scoped_events_share_a_key() {
        let member = UpstreamEvent::MemberUpsert {
            community_id: sf(1),
            member: member_dto(5),
        };
        let role = UpstreamEvent::RoleDelete {
            community_id: sf(1),
            role_id: sf(7),
        };
        let channel = UpstreamEvent::ChannelUpsert(channel_dto(11, 1, None, ChannelKind::Text));
        let deleted = UpstreamEvent::ChannelDelete {
            community_id: sf(1),
            channel_id: sf(12),
        };
        assert_eq!(member.ordering_key(), role.ordering_key());
        assert_eq!(channel.ordering_key(), "community:1");
        assert_eq!(deleted.ordering_key(), "community:1");
        assert!(channel.is_structural());
        assert!(!member.is_structural());
    }

    #[tokio::test]
    async fn live_reply_links_immediately() {
        let h = harness().await;
        h.handler
            .handle(UpstreamEvent::MessageCreate(message_dto(100, 10, 5)))
            .await
            .unwrap();
        h.handler
            .handle(UpstreamEvent::MessageCreate(reply_dto(200, 10, 5, 100)))
            .await
            .unwrap();

        let services = Services::new(&h.db.manager);
        let reply = services.messages.get(sf(200)).await.unwrap().unwrap();
        assert_eq!(reply.reference_id, Some(sf(100)));
        assert_eq!(h.recorder.names(), vec!["message_received", "message_received"]);
    }

    #[tokio::test]
    async fn reactions_follow_add_and_remove() {
        let h = harness().await;
        h.handler
            .handle(UpstreamEvent::MessageCreate(message_dto(100, 10, 5)))
            .await
            .unwrap();
        for event in [
            reaction(100, 7, true),
            reaction(100, 8, true),
            reaction(100, 7, true),
            reaction(100, 7, false),
        ] {
            h.handler.handle(event).await.unwrap();
        }

        let services = Services::new(&h.db.manager);
        let stored = services.reactions.get(&thumbs_up(100)).await.unwrap().unwrap();
        assert_eq!(stored.count(), 1);
        assert!(stored.user_ids.contains(&sf(8)));

        h.handler.handle(reaction(100, 8, false)).await.unwrap();
        assert!(services.reactions.get(&thumbs_up(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletions_keep_the_mirror() {
        let h = harness().await;
        h.handler
            .handle(UpstreamEvent::MessageCreate(message_dto(100, 10, 5)))
            .await
            .unwrap();
        h.handler
            .handle(UpstreamEvent::MessageDelete {
                channel_id: sf(10),
                message_id: sf(100),
            })
            .await
            .unwrap();

        let services = Services::new(&h.db.manager);
        assert!(services.messages.get(sf(100)).await.unwrap().is_some());
        assert!(h.recorder.names().contains(&"message_deleted"));
    }

    #[tokio::test]
    async fn ingest_applies_lines_in_channel_order() {
        let h = harness().await;
        let lines = [
            serde_json::to_string(&UpstreamEvent::ChannelUpsert(channel_dto(
                11,
                1,
                None,
                ChannelKind::Text,
            )))
            .unwrap(),
            serde_json::to_string(&UpstreamEvent::MessageCreate(message_dto(300, 11, 5))).unwrap(),
            String::new(),
            "{not json".to_string(),
            serde_json::to_string(&UpstreamEvent::UserUpdate(user_dto(9))).unwrap(),
            serde_json::to_string(&reaction(999, 7, true)).unwrap(),
        ]
        .join("\n");

        let report = ingest_lines(
            lines.as_bytes(),
            h.handler.clone(),
            &KeyedQueue::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            IngestReport {
                received: 5,
                malformed: 1,
                applied: 3,
                failed: 1,
            }
        );
        let services = Services::new(&h.db.manager);
        assert!(services.messages.get(sf(300)).await.unwrap().is_some());
        assert!(services.users.get(sf(9)).await.unwrap().is_some());
        assert!(h.recorder.names().contains(&"sync_error"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn child_channels_land_after_their_category() {
        let h = harness().await;
        let queue = KeyedQueue::new();
        for round in 0..20u64 {
            let category = 1_000 + round * 10;
            let child = category + 1;
            let lines = [
                UpstreamEvent::ChannelUpsert(channel_dto(category, 1, None, ChannelKind::Category)),
                UpstreamEvent::ChannelUpsert(channel_dto(child, 1, Some(category), ChannelKind::Text)),
                UpstreamEvent::MessageCreate(message_dto(child * 10, child, 5)),
            ]
            .iter()
            .map(|event| serde_json::to_string(event).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

            let report = ingest_lines(
                lines.as_bytes(),
                h.handler.clone(),
                &queue,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(report.failed, 0, "round {round}");
            assert_eq!(report.applied, 3, "round {round}");
        }

        let services = Services::new(&h.db.manager);
        let stored = services.channels.get(sf(1_011)).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, Some(sf(1_010)));
        // Seeded channel 10 plus a category and a child per round.
        assert_eq!(services.channels.list(sf(1)).await.unwrap().len(), 41);
    }
}
