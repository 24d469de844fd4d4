use std::sync::Arc;

use futures::future::BoxFuture;

use crate::db::{DatabaseError, DatabaseManager};
use crate::utils::SyncError;

pub mod attachment;
pub mod channel;
pub mod community;
pub mod member;
pub mod message;
pub mod reaction;
pub mod role;

pub use self::attachment::AttachmentService;
pub use self::channel::ChannelService;
pub use self::community::CommunityService;
pub use self::member::{MemberService, UserService};
pub use self::message::{MessageService, MessageUpsert, ReferenceMode};
pub use self::reaction::{ReactionService, ReactionSnapshot};
pub use self::role::RoleService;

/// Runs `insert`; if a concurrent writer created the row first, runs `update` instead.
pub(crate) async fn create_or_replace<'a, U>(
    insert: BoxFuture<'a, Result<(), DatabaseError>>,
    update: U,
) -> Result<(), SyncError>
where
    U: FnOnce() -> BoxFuture<'a, Result<(), DatabaseError>>,
{
    match insert.await {
        Err(DatabaseError::Duplicate(_)) => Ok(update().await?),
        other => Ok(other?),
    }
}

/// One upsert service per entity type, sharing the same store.
#[derive(Clone)]
pub struct Services {
    pub communities: Arc<CommunityService>,
    pub channels: Arc<ChannelService>,
    pub roles: Arc<RoleService>,
    pub users: Arc<UserService>,
    pub members: Arc<MemberService>,
    pub messages: Arc<MessageService>,
    pub attachments: Arc<AttachmentService>,
    pub reactions: Arc<ReactionService>,
}

impl Services {
    pub fn new(db: &DatabaseManager) -> Self {
        let users = Arc::new(UserService::new(db.user_store()));
        let attachments = Arc::new(AttachmentService::new(db.attachment_store()));

        Self {
            communities: Arc::new(CommunityService::new(db.community_store())),
            channels: Arc::new(ChannelService::new(
                db.channel_store(),
                db.community_store(),
            )),
            roles: Arc::new(RoleService::new(db.role_store(), db.community_store())),
            members: Arc::new(MemberService::new(
                db.member_store(),
                db.community_store(),
                users.clone(),
            )),
            messages: Arc::new(MessageService::new(
                db.message_store(),
                db.channel_store(),
                users.clone(),
                attachments.clone(),
            )),
            reactions: Arc::new(ReactionService::new(
                db.reaction_store(),
                db.message_store(),
            )),
            users,
            attachments,
        }
    }
}
