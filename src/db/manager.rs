use std::sync::Arc;

use diesel::RunQueryDsl;
use diesel::connection::SimpleConnection;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::db::sqlite::{
    SqliteAttachmentStore, SqliteChannelStore, SqliteCheckpointStore, SqliteCommunityStore,
    SqliteMemberStore, SqliteMessageStore, SqlitePool, SqliteReactionStore, SqliteRoleStore,
    SqliteUserStore, build_pool, run_blocking,
};
use crate::db::{
    AttachmentStore, ChannelStore, CheckpointStore, CommunityStore, DatabaseError, MemberStore,
    MessageStore, ReactionStore, RoleStore, UserStore,
};

#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
    community_store: Arc<dyn CommunityStore>,
    channel_store: Arc<dyn ChannelStore>,
    role_store: Arc<dyn RoleStore>,
    user_store: Arc<dyn UserStore>,
    member_store: Arc<dyn MemberStore>,
    message_store: Arc<dyn MessageStore>,
    attachment_store: Arc<dyn AttachmentStore>,
    reaction_store: Arc<dyn ReactionStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let path = config.sqlite_path().ok_or_else(|| {
            DatabaseError::Connection("only sqlite databases are supported".to_string())
        })?;
        Self::open(&path, config.max_connections, config.busy_timeout_ms)
    }

    pub fn open(
        path: &str,
        max_connections: u32,
        busy_timeout_ms: u64,
    ) -> Result<Self, DatabaseError> {
        let pool = build_pool(path, max_connections, busy_timeout_ms)?;
        info!("opened sqlite database at {}", path);

        Ok(Self {
            community_store: Arc::new(SqliteCommunityStore::new(pool.clone())),
            channel_store: Arc::new(SqliteChannelStore::new(pool.clone())),
            role_store: Arc::new(SqliteRoleStore::new(pool.clone())),
            user_store: Arc::new(SqliteUserStore::new(pool.clone())),
            member_store: Arc::new(SqliteMemberStore::new(pool.clone())),
            message_store: Arc::new(SqliteMessageStore::new(pool.clone())),
            attachment_store: Arc::new(SqliteAttachmentStore::new(pool.clone())),
            reaction_store: Arc::new(SqliteReactionStore::new(pool.clone())),
            checkpoint_store: Arc::new(SqliteCheckpointStore::new(pool.clone())),
            pool,
        })
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        run_blocking(&self.pool, |conn| {
            conn.batch_execute("PRAGMA journal_mode = WAL;")
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS communities (
                    id TEXT PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL,
                    owner_id TEXT,
                    icon TEXT,
                    description TEXT,
                    created_at TEXT NOT NULL,
                    last_synced_at TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channels (
                    id TEXT PRIMARY KEY NOT NULL,
                    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
                    parent_id TEXT REFERENCES channels(id) ON DELETE SET NULL,
                    kind INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    topic TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    nsfw INTEGER NOT NULL DEFAULT 0,
                    flags BIGINT NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_synced_at TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS roles (
                    id TEXT PRIMARY KEY NOT NULL,
                    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    color INTEGER NOT NULL DEFAULT 0,
                    position INTEGER NOT NULL DEFAULT 0,
                    permissions TEXT NOT NULL DEFAULT '0',
                    hoisted INTEGER NOT NULL DEFAULT 0,
                    mentionable INTEGER NOT NULL DEFAULT 0,
                    managed INTEGER NOT NULL DEFAULT 0
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY NOT NULL,
                    username TEXT NOT NULL,
                    display_name TEXT,
                    avatar TEXT,
                    bot INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_seen_at TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS members (
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
                    nickname TEXT,
                    joined_at TEXT,
                    role_ids TEXT NOT NULL DEFAULT '[]',
                    pending INTEGER NOT NULL DEFAULT 0,
                    last_synced_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, community_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY NOT NULL,
                    channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                    author_id TEXT NOT NULL REFERENCES users(id),
                    content TEXT NOT NULL DEFAULT '',
                    kind INTEGER NOT NULL DEFAULT 0,
                    pinned INTEGER NOT NULL DEFAULT 0,
                    tts INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    edited_at TEXT,
                    reference_id TEXT REFERENCES messages(id) ON DELETE SET NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS embeds (
                    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    kind TEXT,
                    title TEXT,
                    description TEXT,
                    url TEXT,
                    color INTEGER,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (message_id, position)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS attachments (
                    id TEXT PRIMARY KEY NOT NULL,
                    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                    filename TEXT NOT NULL,
                    url TEXT NOT NULL,
                    proxy_url TEXT,
                    size BIGINT NOT NULL DEFAULT 0,
                    width INTEGER,
                    height INTEGER,
                    content_type TEXT,
                    local_path TEXT,
                    cached INTEGER NOT NULL DEFAULT 0,
                    status INTEGER NOT NULL DEFAULT 0,
                    content_hash TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    skip_reason TEXT,
                    retryable INTEGER NOT NULL DEFAULT 1,
                    downloaded_at TEXT,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS reactions (
                    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                    emote_kind TEXT NOT NULL,
                    emote_value TEXT NOT NULL,
                    emote_name TEXT NOT NULL,
                    reaction_count INTEGER NOT NULL,
                    user_ids TEXT NOT NULL,
                    PRIMARY KEY (message_id, emote_kind, emote_value)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS checkpoints (
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    status INTEGER NOT NULL DEFAULT 0,
                    last_synced_at TEXT,
                    cursor TEXT,
                    error TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (entity_type, entity_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_channels_community ON channels(community_id)",
                "CREATE INDEX IF NOT EXISTS idx_roles_community ON roles(community_id)",
                "CREATE INDEX IF NOT EXISTS idx_members_community ON members(community_id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id)",
                "CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)",
                "CREATE INDEX IF NOT EXISTS idx_attachments_hash ON attachments(content_hash)",
                "CREATE INDEX IF NOT EXISTS idx_attachments_status ON attachments(status)",
                "CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await?;

        info!("database schema is up to date");
        Ok(())
    }

    pub fn community_store(&self) -> Arc<dyn CommunityStore> {
        self.community_store.clone()
    }

    pub fn channel_store(&self) -> Arc<dyn ChannelStore> {
        self.channel_store.clone()
    }

    pub fn role_store(&self) -> Arc<dyn RoleStore> {
        self.role_store.clone()
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn member_store(&self) -> Arc<dyn MemberStore> {
        self.member_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn attachment_store(&self) -> Arc<dyn AttachmentStore> {
        self.attachment_store.clone()
    }

    pub fn reaction_store(&self) -> Arc<dyn ReactionStore> {
        self.reaction_store.clone()
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        self.checkpoint_store.clone()
    }
}
