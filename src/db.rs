pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    Attachment, AttachmentStatus, Channel, ChannelKind, Checkpoint, CheckpointKey,
    CheckpointStatus, Community, Embed, EmoteKey, EntityType, Member, MemberKey, Message,
    MessageKind, Reaction, ReactionKey, Role, User,
};
pub use self::stores::{
    AttachmentStore, ChannelStore, CheckpointStore, CommunityStore, MemberStore, MessageStore,
    ReactionStore, RoleStore, UserStore,
};

pub mod error;
pub mod manager;
pub mod models;
pub mod schema_sqlite;
pub mod sqlite;
pub mod stores;
