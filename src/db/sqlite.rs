use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sqlite::SqliteConnection;

use super::DatabaseError;
use super::models::{
    Attachment, AttachmentStatus, Channel, ChannelKind, Checkpoint, CheckpointKey,
    CheckpointStatus, Community, Embed, EmoteKey, EntityType, Member, MemberKey, Message,
    MessageKind, Reaction, ReactionKey, Role, User,
};
use crate::db::schema_sqlite::{
    attachments, channels, checkpoints, communities, embeds, members, messages, reactions, roles,
    users,
};
use crate::snowflake::Snowflake;

pub type SqlitePool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

// Fixed-width UTC text so that string comparison orders chronologically.
pub(crate) fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn opt_string_to_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(string_to_datetime).transpose()
}

fn parse_id(s: &str) -> Result<Snowflake, DatabaseError> {
    Snowflake::parse(s).map_err(|e| DatabaseError::Query(format!("invalid id in database: {e}")))
}

fn parse_opt_id(s: Option<&str>) -> Result<Option<Snowflake>, DatabaseError> {
    s.map(parse_id).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Query(format!("encode failed: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Query(format!("decode failed: {e}")))
}

fn expect_one_row(affected: usize, what: &str) -> Result<(), DatabaseError> {
    if affected == 0 {
        return Err(DatabaseError::NotFound(what.to_string()));
    }
    Ok(())
}

#[derive(Debug)]
struct ConnectionPragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

pub fn build_pool(
    path: &str,
    max_connections: u32,
    busy_timeout_ms: u64,
) -> Result<SqlitePool, DatabaseError> {
    let manager = ConnectionManager::<SqliteConnection>::new(path);
    r2d2::Pool::builder()
        .max_size(max_connections)
        .connection_customizer(Box::new(ConnectionPragmas { busy_timeout_ms }))
        .build(manager)
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Runs `f` on a pooled connection off the async runtime.
pub(crate) async fn run_blocking<T, F>(pool: &SqlitePool, f: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = communities)]
struct DbCommunity {
    id: String,
    name: String,
    owner_id: Option<String>,
    icon: Option<String>,
    description: Option<String>,
    created_at: String,
    last_synced_at: Option<String>,
}

impl DbCommunity {
    fn to_community(&self) -> Result<Community, DatabaseError> {
        Ok(Community {
            id: parse_id(&self.id)?,
            name: self.name.clone(),
            owner_id: parse_opt_id(self.owner_id.as_deref())?,
            icon: self.icon.clone(),
            description: self.description.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            last_synced_at: opt_string_to_datetime(self.last_synced_at.as_deref())?,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = communities, treat_none_as_null = true)]
struct CommunityRow {
    id: String,
    name: String,
    owner_id: Option<String>,
    icon: Option<String>,
    description: Option<String>,
    created_at: String,
    last_synced_at: Option<String>,
}

impl CommunityRow {
    fn from_community(c: &Community) -> Self {
        Self {
            id: c.id.to_string(),
            name: c.name.clone(),
            owner_id: c.owner_id.map(|v| v.to_string()),
            icon: c.icon.clone(),
            description: c.description.clone(),
            created_at: datetime_to_string(&c.created_at),
            last_synced_at: c.last_synced_at.as_ref().map(datetime_to_string),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channels)]
struct DbChannel {
    id: String,
    community_id: String,
    parent_id: Option<String>,
    kind: i32,
    name: String,
    topic: Option<String>,
    position: i32,
    nsfw: bool,
    flags: i64,
    created_at: String,
    last_synced_at: Option<String>,
}

impl DbChannel {
    fn to_channel(&self) -> Result<Channel, DatabaseError> {
        Ok(Channel {
            id: parse_id(&self.id)?,
            community_id: parse_id(&self.community_id)?,
            parent_id: parse_opt_id(self.parent_id.as_deref())?,
            kind: ChannelKind::from(self.kind),
            name: self.name.clone(),
            topic: self.topic.clone(),
            position: self.position,
            nsfw: self.nsfw,
            flags: self.flags,
            created_at: string_to_datetime(&self.created_at)?,
            last_synced_at: opt_string_to_datetime(self.last_synced_at.as_deref())?,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = channels, treat_none_as_null = true)]
struct ChannelRow {
    id: String,
    community_id: String,
    parent_id: Option<String>,
    kind: i32,
    name: String,
    topic: Option<String>,
    position: i32,
    nsfw: bool,
    flags: i64,
    created_at: String,
    last_synced_at: Option<String>,
}

impl ChannelRow {
    fn from_channel(c: &Channel) -> Self {
        Self {
            id: c.id.to_string(),
            community_id: c.community_id.to_string(),
            parent_id: c.parent_id.map(|v| v.to_string()),
            kind: c.kind.code(),
            name: c.name.clone(),
            topic: c.topic.clone(),
            position: c.position,
            nsfw: c.nsfw,
            flags: c.flags,
            created_at: datetime_to_string(&c.created_at),
            last_synced_at: c.last_synced_at.as_ref().map(datetime_to_string),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = roles)]
struct RoleRow {
    id: String,
    community_id: String,
    name: String,
    color: i32,
    position: i32,
    permissions: String,
    hoisted: bool,
    mentionable: bool,
    managed: bool,
}

impl RoleRow {
    fn from_role(r: &Role) -> Self {
        Self {
            id: r.id.to_string(),
            community_id: r.community_id.to_string(),
            name: r.name.clone(),
            color: r.color,
            position: r.position,
            permissions: r.permissions.clone(),
            hoisted: r.hoisted,
            mentionable: r.mentionable,
            managed: r.managed,
        }
    }

    fn to_role(&self) -> Result<Role, DatabaseError> {
        Ok(Role {
            id: parse_id(&self.id)?,
            community_id: parse_id(&self.community_id)?,
            name: self.name.clone(),
            color: self.color,
            position: self.position,
            permissions: self.permissions.clone(),
            hoisted: self.hoisted,
            mentionable: self.mentionable,
            managed: self.managed,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = users, treat_none_as_null = true)]
struct UserRow {
    id: String,
    username: String,
    display_name: Option<String>,
    avatar: Option<String>,
    bot: bool,
    created_at: String,
    last_seen_at: Option<String>,
}

impl UserRow {
    fn from_user(u: &User) -> Self {
        Self {
            id: u.id.to_string(),
            username: u.username.clone(),
            display_name: u.display_name.clone(),
            avatar: u.avatar.clone(),
            bot: u.bot,
            created_at: datetime_to_string(&u.created_at),
            last_seen_at: u.last_seen_at.as_ref().map(datetime_to_string),
        }
    }

    fn to_user(&self) -> Result<User, DatabaseError> {
        Ok(User {
            id: parse_id(&self.id)?,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
            bot: self.bot,
            created_at: string_to_datetime(&self.created_at)?,
            last_seen_at: opt_string_to_datetime(self.last_seen_at.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = members, primary_key(user_id, community_id), treat_none_as_null = true)]
struct MemberRow {
    user_id: String,
    community_id: String,
    nickname: Option<String>,
    joined_at: Option<String>,
    role_ids: String,
    pending: bool,
    last_synced_at: String,
}

impl MemberRow {
    fn from_member(m: &Member) -> Result<Self, DatabaseError> {
        Ok(Self {
            user_id: m.user_id.to_string(),
            community_id: m.community_id.to_string(),
            nickname: m.nickname.clone(),
            joined_at: m.joined_at.as_ref().map(datetime_to_string),
            role_ids: to_json(&m.role_ids)?,
            pending: m.pending,
            last_synced_at: datetime_to_string(&m.last_synced_at),
        })
    }

    fn to_member(&self) -> Result<Member, DatabaseError> {
        Ok(Member {
            user_id: parse_id(&self.user_id)?,
            community_id: parse_id(&self.community_id)?,
            nickname: self.nickname.clone(),
            joined_at: opt_string_to_datetime(self.joined_at.as_deref())?,
            role_ids: from_json(&self.role_ids)?,
            pending: self.pending,
            last_synced_at: string_to_datetime(&self.last_synced_at)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = messages, treat_none_as_null = true)]
struct MessageRow {
    id: String,
    channel_id: String,
    author_id: String,
    content: String,
    kind: i32,
    pinned: bool,
    tts: bool,
    created_at: String,
    edited_at: Option<String>,
    reference_id: Option<String>,
}

impl MessageRow {
    fn from_message(m: &Message) -> Self {
        Self {
            id: m.id.to_string(),
            channel_id: m.channel_id.to_string(),
            author_id: m.author_id.to_string(),
            content: m.content.clone(),
            kind: m.kind.code(),
            pinned: m.pinned,
            tts: m.tts,
            created_at: datetime_to_string(&m.timestamp),
            edited_at: m.edited_at.as_ref().map(datetime_to_string),
            reference_id: m.reference_id.map(|v| v.to_string()),
        }
    }

    fn to_message(&self) -> Result<Message, DatabaseError> {
        Ok(Message {
            id: parse_id(&self.id)?,
            channel_id: parse_id(&self.channel_id)?,
            author_id: parse_id(&self.author_id)?,
            content: self.content.clone(),
            kind: MessageKind::from(self.kind),
            pinned: self.pinned,
            tts: self.tts,
            timestamp: string_to_datetime(&self.created_at)?,
            edited_at: opt_string_to_datetime(self.edited_at.as_deref())?,
            reference_id: parse_opt_id(self.reference_id.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = embeds)]
struct EmbedRow {
    message_id: String,
    position: i32,
    kind: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    color: Option<i32>,
    payload: String,
}

impl EmbedRow {
    fn from_embed(e: &Embed) -> Self {
        Self {
            message_id: e.message_id.to_string(),
            position: e.position,
            kind: e.kind.clone(),
            title: e.title.clone(),
            description: e.description.clone(),
            url: e.url.clone(),
            color: e.color,
            payload: e.payload.clone(),
        }
    }

    fn to_embed(&self) -> Result<Embed, DatabaseError> {
        Ok(Embed {
            message_id: parse_id(&self.message_id)?,
            position: self.position,
            kind: self.kind.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            url: self.url.clone(),
            color: self.color,
            payload: self.payload.clone(),
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = attachments)]
struct AttachmentRow {
    id: String,
    message_id: String,
    filename: String,
    url: String,
    proxy_url: Option<String>,
    size: i64,
    width: Option<i32>,
    height: Option<i32>,
    content_type: Option<String>,
    local_path: Option<String>,
    cached: bool,
    status: i32,
    content_hash: Option<String>,
    attempts: i32,
    last_error: Option<String>,
    skip_reason: Option<String>,
    retryable: bool,
    downloaded_at: Option<String>,
    updated_at: String,
}

impl AttachmentRow {
    fn from_attachment(a: &Attachment) -> Self {
        Self {
            id: a.id.to_string(),
            message_id: a.message_id.to_string(),
            filename: a.filename.clone(),
            url: a.url.clone(),
            proxy_url: a.proxy_url.clone(),
            size: a.size,
            width: a.width,
            height: a.height,
            content_type: a.content_type.clone(),
            local_path: a.local_path.clone(),
            cached: a.cached,
            status: a.status.code(),
            content_hash: a.content_hash.clone(),
            attempts: a.attempts,
            last_error: a.last_error.clone(),
            skip_reason: a.skip_reason.clone(),
            retryable: a.retryable,
            downloaded_at: a.downloaded_at.as_ref().map(datetime_to_string),
            updated_at: datetime_to_string(&a.updated_at),
        }
    }

    fn to_attachment(&self) -> Result<Attachment, DatabaseError> {
        let status = AttachmentStatus::from_code(self.status).ok_or_else(|| {
            DatabaseError::Query(format!("unknown attachment status {}", self.status))
        })?;
        Ok(Attachment {
            id: parse_id(&self.id)?,
            message_id: parse_id(&self.message_id)?,
            filename: self.filename.clone(),
            url: self.url.clone(),
            proxy_url: self.proxy_url.clone(),
            size: self.size,
            width: self.width,
            height: self.height,
            content_type: self.content_type.clone(),
            local_path: self.local_path.clone(),
            cached: self.cached,
            status,
            content_hash: self.content_hash.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            skip_reason: self.skip_reason.clone(),
            retryable: self.retryable,
            downloaded_at: opt_string_to_datetime(self.downloaded_at.as_deref())?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

/// Upstream-owned columns; a refresh from upstream never touches tracking.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = attachments, treat_none_as_null = true)]
struct AttachmentMetadataChanges {
    message_id: String,
    filename: String,
    url: String,
    proxy_url: Option<String>,
    size: i64,
    width: Option<i32>,
    height: Option<i32>,
    content_type: Option<String>,
    updated_at: String,
}

impl AttachmentMetadataChanges {
    fn from_attachment(a: &Attachment) -> Self {
        Self {
            message_id: a.message_id.to_string(),
            filename: a.filename.clone(),
            url: a.url.clone(),
            proxy_url: a.proxy_url.clone(),
            size: a.size,
            width: a.width,
            height: a.height,
            content_type: a.content_type.clone(),
            updated_at: datetime_to_string(&a.updated_at),
        }
    }
}

/// Download-tracking columns; written by the pipeline, worker and reconciler.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = attachments, treat_none_as_null = true)]
struct AttachmentTrackingChanges {
    local_path: Option<String>,
    cached: bool,
    status: i32,
    content_hash: Option<String>,
    attempts: i32,
    last_error: Option<String>,
    skip_reason: Option<String>,
    retryable: bool,
    downloaded_at: Option<String>,
    updated_at: String,
}

impl AttachmentTrackingChanges {
    fn from_attachment(a: &Attachment) -> Self {
        Self {
            local_path: a.local_path.clone(),
            cached: a.cached,
            status: a.status.code(),
            content_hash: a.content_hash.clone(),
            attempts: a.attempts,
            last_error: a.last_error.clone(),
            skip_reason: a.skip_reason.clone(),
            retryable: a.retryable,
            downloaded_at: a.downloaded_at.as_ref().map(datetime_to_string),
            updated_at: datetime_to_string(&a.updated_at),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = reactions, primary_key(message_id, emote_kind, emote_value))]
struct ReactionRow {
    message_id: String,
    emote_kind: String,
    emote_value: String,
    emote_name: String,
    reaction_count: i32,
    user_ids: String,
}

impl ReactionRow {
    fn from_reaction(r: &Reaction) -> Result<Self, DatabaseError> {
        Ok(Self {
            message_id: r.message_id.to_string(),
            emote_kind: r.emote.kind().to_string(),
            emote_value: r.emote.value(),
            emote_name: r.emote_name.clone(),
            reaction_count: r.count() as i32,
            user_ids: to_json(&r.user_ids)?,
        })
    }

    fn to_reaction(&self) -> Result<Reaction, DatabaseError> {
        let emote = EmoteKey::from_parts(&self.emote_kind, &self.emote_value)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let user_ids: BTreeSet<Snowflake> = from_json(&self.user_ids)?;
        Ok(Reaction {
            message_id: parse_id(&self.message_id)?,
            emote,
            emote_name: self.emote_name.clone(),
            user_ids,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(
    table_name = checkpoints,
    primary_key(entity_type, entity_id),
    treat_none_as_null = true
)]
struct CheckpointRow {
    entity_type: String,
    entity_id: String,
    status: i32,
    last_synced_at: Option<String>,
    cursor: Option<String>,
    error: Option<String>,
    updated_at: String,
}

impl CheckpointRow {
    fn from_checkpoint(c: &Checkpoint) -> Self {
        Self {
            entity_type: c.key.entity_type.as_str().to_string(),
            entity_id: c.key.entity_id.to_string(),
            status: c.status.code(),
            last_synced_at: c.last_synced_at.as_ref().map(datetime_to_string),
            cursor: c.cursor.map(|v| v.to_string()),
            error: c.error.clone(),
            updated_at: datetime_to_string(&c.updated_at),
        }
    }

    fn to_checkpoint(&self) -> Result<Checkpoint, DatabaseError> {
        let entity_type =
            EntityType::parse(&self.entity_type).map_err(|e| DatabaseError::Query(e.to_string()))?;
        let status = CheckpointStatus::from_code(self.status).ok_or_else(|| {
            DatabaseError::Query(format!("unknown checkpoint status {}", self.status))
        })?;
        Ok(Checkpoint {
            key: CheckpointKey {
                entity_type,
                entity_id: parse_id(&self.entity_id)?,
            },
            status,
            last_synced_at: opt_string_to_datetime(self.last_synced_at.as_deref())?,
            cursor: parse_opt_id(self.cursor.as_deref())?,
            error: self.error.clone(),
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

pub struct SqliteCommunityStore {
    pool: SqlitePool,
}

impl SqliteCommunityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::CommunityStore for SqliteCommunityStore {
    async fn get_community(&self, id: Snowflake) -> Result<Option<Community>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            communities::table
                .find(id.to_string())
                .select(DbCommunity::as_select())
                .first::<DbCommunity>(conn)
                .optional()?
                .map(|row| row.to_community())
                .transpose()
        })
        .await
    }

    async fn insert_community(&self, community: &Community) -> Result<(), DatabaseError> {
        let row = CommunityRow::from_community(community);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(communities::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_community(&self, community: &Community) -> Result<(), DatabaseError> {
        let row = CommunityRow::from_community(community);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(communities::table.find(row.id.clone()))
                .set(&row)
                .execute(conn)?;
            expect_one_row(affected, "community")
        })
        .await
    }
}

pub struct SqliteChannelStore {
    pool: SqlitePool,
}

impl SqliteChannelStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::ChannelStore for SqliteChannelStore {
    async fn get_channel(&self, id: Snowflake) -> Result<Option<Channel>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            channels::table
                .find(id.to_string())
                .select(DbChannel::as_select())
                .first::<DbChannel>(conn)
                .optional()?
                .map(|row| row.to_channel())
                .transpose()
        })
        .await
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<(), DatabaseError> {
        let row = ChannelRow::from_channel(channel);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(channels::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_channel(&self, channel: &Channel) -> Result<(), DatabaseError> {
        let row = ChannelRow::from_channel(channel);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(channels::table.find(row.id.clone()))
                .set(&row)
                .execute(conn)?;
            expect_one_row(affected, "channel")
        })
        .await
    }

    async fn list_channels_by_community(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<Channel>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            channels::table
                .filter(channels::community_id.eq(community_id.to_string()))
                .order(channels::position.asc())
                .select(DbChannel::as_select())
                .load::<DbChannel>(conn)?
                .iter()
                .map(DbChannel::to_channel)
                .collect()
        })
        .await
    }
}

pub struct SqliteRoleStore {
    pool: SqlitePool,
}

impl SqliteRoleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::RoleStore for SqliteRoleStore {
    async fn get_role(&self, id: Snowflake) -> Result<Option<Role>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            roles::table
                .find(id.to_string())
                .select(RoleRow::as_select())
                .first::<RoleRow>(conn)
                .optional()?
                .map(|row| row.to_role())
                .transpose()
        })
        .await
    }

    async fn insert_role(&self, role: &Role) -> Result<(), DatabaseError> {
        let row = RoleRow::from_role(role);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(roles::table).values(&row).execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_role(&self, role: &Role) -> Result<(), DatabaseError> {
        let row = RoleRow::from_role(role);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(roles::table.find(row.id.clone()))
                .set(&row)
                .execute(conn)?;
            expect_one_row(affected, "role")
        })
        .await
    }

    async fn list_roles_by_community(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<Role>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            roles::table
                .filter(roles::community_id.eq(community_id.to_string()))
                .order(roles::position.asc())
                .select(RoleRow::as_select())
                .load::<RoleRow>(conn)?
                .iter()
                .map(RoleRow::to_role)
                .collect()
        })
        .await
    }
}

pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn get_user(&self, id: Snowflake) -> Result<Option<User>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            users::table
                .find(id.to_string())
                .select(UserRow::as_select())
                .first::<UserRow>(conn)
                .optional()?
                .map(|row| row.to_user())
                .transpose()
        })
        .await
    }

    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError> {
        let row = UserRow::from_user(user);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(users::table).values(&row).execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_user(&self, user: &User) -> Result<(), DatabaseError> {
        let row = UserRow::from_user(user);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(users::table.find(row.id.clone()))
                .set(&row)
                .execute(conn)?;
            expect_one_row(affected, "user")
        })
        .await
    }
}

pub struct SqliteMemberStore {
    pool: SqlitePool,
}

impl SqliteMemberStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MemberStore for SqliteMemberStore {
    async fn get_member(&self, key: &MemberKey) -> Result<Option<Member>, DatabaseError> {
        let key = *key;
        run_blocking(&self.pool, move |conn| {
            members::table
                .find((key.user_id.to_string(), key.community_id.to_string()))
                .select(MemberRow::as_select())
                .first::<MemberRow>(conn)
                .optional()?
                .map(|row| row.to_member())
                .transpose()
        })
        .await
    }

    async fn insert_member(&self, member: &Member) -> Result<(), DatabaseError> {
        let row = MemberRow::from_member(member)?;
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(members::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_member(&self, member: &Member) -> Result<(), DatabaseError> {
        let row = MemberRow::from_member(member)?;
        run_blocking(&self.pool, move |conn| {
            let target = members::table.find((row.user_id.clone(), row.community_id.clone()));
            let affected = diesel::update(target).set(&row).execute(conn)?;
            expect_one_row(affected, "member")
        })
        .await
    }

    async fn list_members_by_community(
        &self,
        community_id: Snowflake,
    ) -> Result<Vec<Member>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            members::table
                .filter(members::community_id.eq(community_id.to_string()))
                .select(MemberRow::as_select())
                .load::<MemberRow>(conn)?
                .iter()
                .map(MemberRow::to_member)
                .collect()
        })
        .await
    }
}

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MessageStore for SqliteMessageStore {
    async fn get_message(&self, id: Snowflake) -> Result<Option<Message>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            messages::table
                .find(id.to_string())
                .select(MessageRow::as_select())
                .first::<MessageRow>(conn)
                .optional()?
                .map(|row| row.to_message())
                .transpose()
        })
        .await
    }

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let row = MessageRow::from_message(message);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(messages::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let row = MessageRow::from_message(message);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(messages::table.find(row.id.clone()))
                .set(&row)
                .execute(conn)?;
            expect_one_row(affected, "message")
        })
        .await
    }

    async fn set_reference(
        &self,
        id: Snowflake,
        reference_id: Option<Snowflake>,
    ) -> Result<(), DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(messages::table.find(id.to_string()))
                .set(messages::reference_id.eq(reference_id.map(|v| v.to_string())))
                .execute(conn)?;
            expect_one_row(affected, "message")
        })
        .await
    }

    async fn count_messages_by_channel(
        &self,
        channel_id: Snowflake,
    ) -> Result<i64, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            Ok(messages::table
                .filter(messages::channel_id.eq(channel_id.to_string()))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn replace_embeds(
        &self,
        message_id: Snowflake,
        embeds: &[Embed],
    ) -> Result<(), DatabaseError> {
        let rows: Vec<EmbedRow> = embeds.iter().map(EmbedRow::from_embed).collect();
        run_blocking(&self.pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                diesel::delete(embeds::table.filter(embeds::message_id.eq(message_id.to_string())))
                    .execute(conn)?;
                for row in &rows {
                    diesel::insert_into(embeds::table).values(row).execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn list_embeds(&self, message_id: Snowflake) -> Result<Vec<Embed>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            embeds::table
                .filter(embeds::message_id.eq(message_id.to_string()))
                .order(embeds::position.asc())
                .select(EmbedRow::as_select())
                .load::<EmbedRow>(conn)?
                .iter()
                .map(EmbedRow::to_embed)
                .collect()
        })
        .await
    }
}

pub struct SqliteAttachmentStore {
    pool: SqlitePool,
}

impl SqliteAttachmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn load_attachments(
    rows: Vec<AttachmentRow>,
) -> Result<Vec<Attachment>, DatabaseError> {
    rows.iter().map(AttachmentRow::to_attachment).collect()
}

#[async_trait]
impl super::AttachmentStore for SqliteAttachmentStore {
    async fn get_attachment(&self, id: Snowflake) -> Result<Option<Attachment>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            attachments::table
                .find(id.to_string())
                .select(AttachmentRow::as_select())
                .first::<AttachmentRow>(conn)
                .optional()?
                .map(|row| row.to_attachment())
                .transpose()
        })
        .await
    }

    async fn insert_attachment(&self, attachment: &Attachment) -> Result<(), DatabaseError> {
        let row = AttachmentRow::from_attachment(attachment);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(attachments::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_attachment_metadata(
        &self,
        attachment: &Attachment,
    ) -> Result<(), DatabaseError> {
        let id = attachment.id.to_string();
        let changes = AttachmentMetadataChanges::from_attachment(attachment);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(attachments::table.find(id))
                .set(&changes)
                .execute(conn)?;
            expect_one_row(affected, "attachment")
        })
        .await
    }

    async fn update_attachment_tracking(
        &self,
        attachment: &Attachment,
    ) -> Result<(), DatabaseError> {
        let id = attachment.id.to_string();
        let changes = AttachmentTrackingChanges::from_attachment(attachment);
        run_blocking(&self.pool, move |conn| {
            let affected = diesel::update(attachments::table.find(id))
                .set(&changes)
                .execute(conn)?;
            expect_one_row(affected, "attachment")
        })
        .await
    }

    async fn delete_attachment(&self, id: Snowflake) -> Result<(), DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            diesel::delete(attachments::table.find(id.to_string())).execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_attachments_by_message(
        &self,
        message_id: Snowflake,
    ) -> Result<Vec<Attachment>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let rows = attachments::table
                .filter(attachments::message_id.eq(message_id.to_string()))
                .select(AttachmentRow::as_select())
                .load::<AttachmentRow>(conn)?;
            load_attachments(rows)
        })
        .await
    }

    async fn find_cached_by_hash(
        &self,
        hash: &str,
        exclude_id: Snowflake,
    ) -> Result<Option<Attachment>, DatabaseError> {
        let hash = hash.to_string();
        run_blocking(&self.pool, move |conn| {
            attachments::table
                .filter(attachments::content_hash.eq(hash))
                .filter(attachments::status.eq(AttachmentStatus::Completed.code()))
                .filter(attachments::cached.eq(true))
                .filter(attachments::local_path.is_not_null())
                .filter(attachments::id.ne(exclude_id.to_string()))
                .order(attachments::downloaded_at.asc())
                .select(AttachmentRow::as_select())
                .first::<AttachmentRow>(conn)
                .optional()?
                .map(|row| row.to_attachment())
                .transpose()
        })
        .await
    }

    async fn list_by_status(
        &self,
        statuses: &[AttachmentStatus],
        limit: i64,
    ) -> Result<Vec<Attachment>, DatabaseError> {
        let codes: Vec<i32> = statuses.iter().map(|s| s.code()).collect();
        run_blocking(&self.pool, move |conn| {
            let rows = attachments::table
                .filter(attachments::status.eq_any(codes))
                .order(attachments::updated_at.asc())
                .limit(limit)
                .select(AttachmentRow::as_select())
                .load::<AttachmentRow>(conn)?;
            load_attachments(rows)
        })
        .await
    }

    async fn list_awaiting_download(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> Result<Vec<Attachment>, DatabaseError> {
        let max_attempts = max_attempts as i32;
        run_blocking(&self.pool, move |conn| {
            let waiting = attachments::status.eq_any(vec![
                AttachmentStatus::Queued.code(),
                AttachmentStatus::Pending.code(),
            ]);
            let retryable_failure = attachments::status
                .eq(AttachmentStatus::Failed.code())
                .and(attachments::retryable.eq(true))
                .and(attachments::attempts.lt(max_attempts));
            let rows = attachments::table
                .filter(waiting.or(retryable_failure))
                .order(attachments::updated_at.asc())
                .limit(limit)
                .select(AttachmentRow::as_select())
                .load::<AttachmentRow>(conn)?;
            load_attachments(rows)
        })
        .await
    }

    async fn list_stale_in_progress(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DatabaseError> {
        let cutoff = datetime_to_string(&updated_before);
        run_blocking(&self.pool, move |conn| {
            let rows = attachments::table
                .filter(attachments::status.eq(AttachmentStatus::InProgress.code()))
                .filter(attachments::updated_at.lt(cutoff))
                .select(AttachmentRow::as_select())
                .load::<AttachmentRow>(conn)?;
            load_attachments(rows)
        })
        .await
    }

    async fn list_cached(&self) -> Result<Vec<Attachment>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let rows = attachments::table
                .filter(attachments::cached.eq(true))
                .filter(attachments::local_path.is_not_null())
                .select(AttachmentRow::as_select())
                .load::<AttachmentRow>(conn)?;
            load_attachments(rows)
        })
        .await
    }

    async fn list_local_paths(&self) -> Result<HashSet<String>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let paths = attachments::table
                .filter(attachments::local_path.is_not_null())
                .select(attachments::local_path)
                .load::<Option<String>>(conn)?;
            Ok(paths.into_iter().flatten().collect())
        })
        .await
    }

    async fn count_by_status(&self) -> Result<Vec<(AttachmentStatus, i64)>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            let counts = attachments::table
                .group_by(attachments::status)
                .select((attachments::status, diesel::dsl::count_star()))
                .load::<(i32, i64)>(conn)?;
            counts
                .into_iter()
                .map(|(code, count)| {
                    AttachmentStatus::from_code(code)
                        .map(|status| (status, count))
                        .ok_or_else(|| {
                            DatabaseError::Query(format!("unknown attachment status {code}"))
                        })
                })
                .collect()
        })
        .await
    }
}

pub struct SqliteReactionStore {
    pool: SqlitePool,
}

impl SqliteReactionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::ReactionStore for SqliteReactionStore {
    async fn get_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>, DatabaseError> {
        let (message_id, kind, value) = (
            key.message_id.to_string(),
            key.emote.kind().to_string(),
            key.emote.value(),
        );
        run_blocking(&self.pool, move |conn| {
            reactions::table
                .find((message_id, kind, value))
                .select(ReactionRow::as_select())
                .first::<ReactionRow>(conn)
                .optional()?
                .map(|row| row.to_reaction())
                .transpose()
        })
        .await
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError> {
        let row = ReactionRow::from_reaction(reaction)?;
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(reactions::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError> {
        let row = ReactionRow::from_reaction(reaction)?;
        run_blocking(&self.pool, move |conn| {
            let target = reactions::table.find((
                row.message_id.clone(),
                row.emote_kind.clone(),
                row.emote_value.clone(),
            ));
            let affected = diesel::update(target).set(&row).execute(conn)?;
            expect_one_row(affected, "reaction")
        })
        .await
    }

    async fn delete_reaction(&self, key: &ReactionKey) -> Result<(), DatabaseError> {
        let (message_id, kind, value) = (
            key.message_id.to_string(),
            key.emote.kind().to_string(),
            key.emote.value(),
        );
        run_blocking(&self.pool, move |conn| {
            diesel::delete(reactions::table.find((message_id, kind, value))).execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_reactions_by_message(
        &self,
        message_id: Snowflake,
    ) -> Result<Vec<Reaction>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            reactions::table
                .filter(reactions::message_id.eq(message_id.to_string()))
                .select(ReactionRow::as_select())
                .load::<ReactionRow>(conn)?
                .iter()
                .map(ReactionRow::to_reaction)
                .collect()
        })
        .await
    }
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::CheckpointStore for SqliteCheckpointStore {
    async fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<Checkpoint>, DatabaseError> {
        let (entity_type, entity_id) = (
            key.entity_type.as_str().to_string(),
            key.entity_id.to_string(),
        );
        run_blocking(&self.pool, move |conn| {
            checkpoints::table
                .find((entity_type, entity_id))
                .select(CheckpointRow::as_select())
                .first::<CheckpointRow>(conn)
                .optional()?
                .map(|row| row.to_checkpoint())
                .transpose()
        })
        .await
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let row = CheckpointRow::from_checkpoint(checkpoint);
        run_blocking(&self.pool, move |conn| {
            diesel::insert_into(checkpoints::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let row = CheckpointRow::from_checkpoint(checkpoint);
        run_blocking(&self.pool, move |conn| {
            let target =
                checkpoints::table.find((row.entity_type.clone(), row.entity_id.clone()));
            let affected = diesel::update(target).set(&row).execute(conn)?;
            expect_one_row(affected, "checkpoint")
        })
        .await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, DatabaseError> {
        run_blocking(&self.pool, move |conn| {
            checkpoints::table
                .order((checkpoints::entity_type.asc(), checkpoints::entity_id.asc()))
                .select(CheckpointRow::as_select())
                .load::<CheckpointRow>(conn)?
                .iter()
                .map(CheckpointRow::to_checkpoint)
                .collect()
        })
        .await
    }
}
