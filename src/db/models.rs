use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snowflake::Snowflake;
use crate::utils::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub id: Snowflake,
    pub name: String,
    pub owner_id: Option<Snowflake>,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Closed set of channel shapes. Wire codes follow the upstream numbering;
/// anything unrecognised is treated as a plain text channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
    Announcement,
    AnnouncementThread,
    PublicThread,
    PrivateThread,
    Stage,
    Directory,
    Forum,
    Media,
}

impl ChannelKind {
    pub fn code(self) -> i32 {
        match self {
            ChannelKind::Text => 0,
            ChannelKind::Voice => 2,
            ChannelKind::Category => 4,
            ChannelKind::Announcement => 5,
            ChannelKind::AnnouncementThread => 10,
            ChannelKind::PublicThread => 11,
            ChannelKind::PrivateThread => 12,
            ChannelKind::Stage => 13,
            ChannelKind::Directory => 14,
            ChannelKind::Forum => 15,
            ChannelKind::Media => 16,
        }
    }

    pub fn is_thread(self) -> bool {
        matches!(
            self,
            ChannelKind::AnnouncementThread | ChannelKind::PublicThread | ChannelKind::PrivateThread
        )
    }

    /// Whether the channel carries a message history of its own.
    pub fn holds_messages(self) -> bool {
        matches!(
            self,
            ChannelKind::Text | ChannelKind::Voice | ChannelKind::Announcement | ChannelKind::Stage
        ) || self.is_thread()
    }
}

impl From<i32> for ChannelKind {
    fn from(code: i32) -> Self {
        match code {
            2 => ChannelKind::Voice,
            4 => ChannelKind::Category,
            5 => ChannelKind::Announcement,
            10 => ChannelKind::AnnouncementThread,
            11 => ChannelKind::PublicThread,
            12 => ChannelKind::PrivateThread,
            13 => ChannelKind::Stage,
            14 => ChannelKind::Directory,
            15 => ChannelKind::Forum,
            16 => ChannelKind::Media,
            _ => ChannelKind::Text,
        }
    }
}

impl From<ChannelKind> for i32 {
    fn from(kind: ChannelKind) -> Self {
        kind.code()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    pub community_id: Snowflake,
    pub parent_id: Option<Snowflake>,
    pub kind: ChannelKind,
    pub name: String,
    pub topic: Option<String>,
    pub position: i32,
    pub nsfw: bool,
    pub flags: i64,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Snowflake,
    pub community_id: Snowflake,
    pub name: String,
    pub color: i32,
    pub position: i32,
    /// Decimal string; the bitset is wider than 64 bits.
    pub permissions: String,
    pub hoisted: bool,
    pub mentionable: bool,
    pub managed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub bot: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberKey {
    pub user_id: Snowflake,
    pub community_id: Snowflake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Snowflake,
    pub community_id: Snowflake,
    pub nickname: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub role_ids: Vec<Snowflake>,
    pub pending: bool,
    pub last_synced_at: DateTime<Utc>,
}

impl Member {
    pub fn key(&self) -> MemberKey {
        MemberKey {
            user_id: self.user_id,
            community_id: self.community_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MessageKind {
    #[default]
    Default,
    RecipientAdd,
    RecipientRemove,
    Call,
    ChannelNameChange,
    ChannelIconChange,
    PinnedMessage,
    MemberJoin,
    Boost,
    ChannelFollowAdd,
    Reply,
    ApplicationCommand,
    ThreadCreated,
    ThreadStarter,
    ContextMenuCommand,
    AutoModerationAction,
    StageStart,
    StageEnd,
}

impl MessageKind {
    pub fn code(self) -> i32 {
        match self {
            MessageKind::Default => 0,
            MessageKind::RecipientAdd => 1,
            MessageKind::RecipientRemove => 2,
            MessageKind::Call => 3,
            MessageKind::ChannelNameChange => 4,
            MessageKind::ChannelIconChange => 5,
            MessageKind::PinnedMessage => 6,
            MessageKind::MemberJoin => 7,
            MessageKind::Boost => 8,
            MessageKind::ChannelFollowAdd => 12,
            MessageKind::ThreadCreated => 18,
            MessageKind::Reply => 19,
            MessageKind::ApplicationCommand => 20,
            MessageKind::ThreadStarter => 21,
            MessageKind::ContextMenuCommand => 23,
            MessageKind::AutoModerationAction => 24,
            MessageKind::StageStart => 27,
            MessageKind::StageEnd => 28,
        }
    }
}

impl From<i32> for MessageKind {
    fn from(code: i32) -> Self {
        match code {
            1 => MessageKind::RecipientAdd,
            2 => MessageKind::RecipientRemove,
            3 => MessageKind::Call,
            4 => MessageKind::ChannelNameChange,
            5 => MessageKind::ChannelIconChange,
            6 => MessageKind::PinnedMessage,
            7 => MessageKind::MemberJoin,
            8..=11 => MessageKind::Boost,
            12 => MessageKind::ChannelFollowAdd,
            18 => MessageKind::ThreadCreated,
            19 => MessageKind::Reply,
            20 => MessageKind::ApplicationCommand,
            21 => MessageKind::ThreadStarter,
            23 => MessageKind::ContextMenuCommand,
            24 => MessageKind::AutoModerationAction,
            27 => MessageKind::StageStart,
            28 => MessageKind::StageEnd,
            _ => MessageKind::Default,
        }
    }
}

impl From<MessageKind> for i32 {
    fn from(kind: MessageKind) -> Self {
        kind.code()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub author_id: Snowflake,
    pub content: String,
    pub kind: MessageKind,
    pub pinned: bool,
    pub tts: bool,
    pub timestamp: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub reference_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub message_id: Snowflake,
    pub position: i32,
    pub kind: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub color: Option<i32>,
    /// Raw upstream payload, kept so nothing the columns miss is lost.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Queued,
}

impl AttachmentStatus {
    pub const ALL: [AttachmentStatus; 6] = [
        AttachmentStatus::Pending,
        AttachmentStatus::InProgress,
        AttachmentStatus::Completed,
        AttachmentStatus::Failed,
        AttachmentStatus::Skipped,
        AttachmentStatus::Queued,
    ];

    pub fn code(self) -> i32 {
        match self {
            AttachmentStatus::Pending => 0,
            AttachmentStatus::InProgress => 1,
            AttachmentStatus::Completed => 2,
            AttachmentStatus::Failed => 3,
            AttachmentStatus::Skipped => 4,
            AttachmentStatus::Queued => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttachmentStatus::Pending => "pending",
            AttachmentStatus::InProgress => "in_progress",
            AttachmentStatus::Completed => "completed",
            AttachmentStatus::Failed => "failed",
            AttachmentStatus::Skipped => "skipped",
            AttachmentStatus::Queued => "queued",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub message_id: Snowflake,
    pub filename: String,
    pub url: String,
    pub proxy_url: Option<String>,
    pub size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub content_type: Option<String>,
    pub local_path: Option<String>,
    pub cached: bool,
    pub status: AttachmentStatus,
    pub content_hash: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub skip_reason: Option<String>,
    pub retryable: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(id: Snowflake, message_id: Snowflake, filename: String, url: String) -> Self {
        Self {
            id,
            message_id,
            filename,
            url,
            proxy_url: None,
            size: 0,
            width: None,
            height: None,
            content_type: None,
            local_path: None,
            cached: false,
            status: AttachmentStatus::Pending,
            content_hash: None,
            attempts: 0,
            last_error: None,
            skip_reason: None,
            retryable: true,
            downloaded_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn mark_downloading(&mut self) {
        self.status = AttachmentStatus::InProgress;
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_cached(&mut self, path: String, hash: String) {
        self.local_path = Some(path);
        self.content_hash = Some(hash);
        self.cached = true;
        self.status = AttachmentStatus::Completed;
        self.downloaded_at = Some(Utc::now());
        self.last_error = None;
        self.skip_reason = None;
        self.retryable = true;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String, retryable: bool) {
        self.status = AttachmentStatus::Failed;
        self.last_error = Some(error);
        self.retryable = retryable;
        self.cached = false;
        self.local_path = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_skipped(&mut self, reason: String) {
        self.status = AttachmentStatus::Skipped;
        self.skip_reason = Some(reason);
        self.updated_at = Utc::now();
    }

    pub fn mark_queued(&mut self) {
        self.status = AttachmentStatus::Queued;
        self.updated_at = Utc::now();
    }

    pub fn reset_cache(&mut self) {
        self.cached = false;
        self.local_path = None;
        self.content_hash = None;
        self.downloaded_at = None;
        self.status = AttachmentStatus::Pending;
        self.updated_at = Utc::now();
    }

    /// Whether a worker pass should pick this record up.
    pub fn awaits_download(&self, max_attempts: u32) -> bool {
        match self.status {
            AttachmentStatus::Pending | AttachmentStatus::Queued => true,
            AttachmentStatus::Failed => self.retryable && (self.attempts as u32) < max_attempts,
            AttachmentStatus::InProgress
            | AttachmentStatus::Completed
            | AttachmentStatus::Skipped => false,
        }
    }
}

/// Either a unicode emoji or a community-defined emote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EmoteKey {
    Unicode(String),
    Custom(Snowflake),
}

impl EmoteKey {
    pub fn kind(&self) -> &'static str {
        match self {
            EmoteKey::Unicode(_) => "unicode",
            EmoteKey::Custom(_) => "custom",
        }
    }

    pub fn value(&self) -> String {
        match self {
            EmoteKey::Unicode(name) => name.clone(),
            EmoteKey::Custom(id) => id.to_string(),
        }
    }

    pub fn from_parts(kind: &str, value: &str) -> Result<Self, SyncError> {
        match kind {
            "unicode" => Ok(EmoteKey::Unicode(value.to_string())),
            "custom" => Ok(EmoteKey::Custom(Snowflake::parse(value)?)),
            other => Err(SyncError::Validation(format!("unknown emote kind: {other}"))),
        }
    }
}

impl fmt::Display for EmoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmoteKey::Unicode(name) => f.write_str(name),
            EmoteKey::Custom(id) => write!(f, "custom:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactionKey {
    pub message_id: Snowflake,
    pub emote: EmoteKey,
}

/// The count is never stored independently of the user set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Snowflake,
    pub emote: EmoteKey,
    pub emote_name: String,
    pub user_ids: BTreeSet<Snowflake>,
}

impl Reaction {
    pub fn new(key: ReactionKey, emote_name: String) -> Self {
        Self {
            message_id: key.message_id,
            emote: key.emote,
            emote_name,
            user_ids: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> ReactionKey {
        ReactionKey {
            message_id: self.message_id,
            emote: self.emote.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.user_ids.len()
    }

    /// Returns false when the user already reacted.
    pub fn add_user(&mut self, user_id: Snowflake) -> bool {
        self.user_ids.insert(user_id)
    }

    pub fn remove_user(&mut self, user_id: Snowflake) -> bool {
        self.user_ids.remove(&user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Community,
    Channel,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Community => "community",
            EntityType::Channel => "channel",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        match raw {
            "community" => Ok(EntityType::Community),
            "channel" => Ok(EntityType::Channel),
            other => Err(SyncError::Validation(format!("unknown entity type: {other}"))),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl CheckpointStatus {
    pub fn code(self) -> i32 {
        match self {
            CheckpointStatus::Idle => 0,
            CheckpointStatus::InProgress => 1,
            CheckpointStatus::Completed => 2,
            CheckpointStatus::Failed => 3,
            CheckpointStatus::Paused => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CheckpointStatus::Idle),
            1 => Some(CheckpointStatus::InProgress),
            2 => Some(CheckpointStatus::Completed),
            3 => Some(CheckpointStatus::Failed),
            4 => Some(CheckpointStatus::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckpointStatus::Idle => "idle",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Paused => "paused",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub entity_type: EntityType,
    pub entity_id: Snowflake,
}

impl CheckpointKey {
    pub fn community(id: Snowflake) -> Self {
        Self {
            entity_type: EntityType::Community,
            entity_id: id,
        }
    }

    pub fn channel(id: Snowflake) -> Self {
        Self {
            entity_type: EntityType::Channel,
            entity_id: id,
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    pub status: CheckpointStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Newest message id confirmed synced (channel checkpoints only).
    pub cursor: Option<Snowflake>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(key: CheckpointKey) -> Self {
        Self {
            key,
            status: CheckpointStatus::Idle,
            last_synced_at: None,
            cursor: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn start(&mut self) {
        self.status = CheckpointStatus::InProgress;
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// The cursor never moves backwards: a smaller value is ignored.
    pub fn complete(&mut self, cursor: Option<Snowflake>) {
        self.status = CheckpointStatus::Completed;
        self.last_synced_at = Some(Utc::now());
        self.cursor = match (self.cursor, cursor) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: String) {
        self.status = CheckpointStatus::Failed;
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    pub fn pause(&mut self) {
        self.status = CheckpointStatus::Paused;
        self.updated_at = Utc::now();
    }

    pub fn resume(&mut self) -> Result<(), SyncError> {
        if self.status != CheckpointStatus::Paused {
            return Err(SyncError::Validation(format!(
                "{} is {} and cannot be resumed",
                self.key, self.status
            )));
        }
        self.status = CheckpointStatus::InProgress;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.status == CheckpointStatus::Paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_checkpoint() -> Checkpoint {
        Checkpoint::new(CheckpointKey::channel(Snowflake::new(7)))
    }

    #[test]
    fn complete_without_cursor_keeps_previous_cursor() {
        let mut cp = channel_checkpoint();
        cp.start();
        cp.complete(Some(Snowflake::new(100)));
        cp.start();
        cp.complete(None);
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert_eq!(cp.cursor, Some(Snowflake::new(100)));
        assert!(cp.last_synced_at.is_some());
    }

    #[test]
    fn fail_leaves_cursor_untouched() {
        let mut cp = channel_checkpoint();
        cp.complete(Some(Snowflake::new(100)));
        cp.start();
        cp.fail("upstream exploded".to_string());
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert_eq!(cp.cursor, Some(Snowflake::new(100)));
        assert_eq!(cp.error.as_deref(), Some("upstream exploded"));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cp = channel_checkpoint();
        cp.complete(Some(Snowflake::new(500)));
        cp.complete(Some(Snowflake::new(300)));
        assert_eq!(cp.cursor, Some(Snowflake::new(500)));
    }

    #[test]
    fn start_clears_previous_error() {
        let mut cp = channel_checkpoint();
        cp.fail("boom".to_string());
        cp.start();
        assert_eq!(cp.status, CheckpointStatus::InProgress);
        assert!(cp.error.is_none());
    }

    #[test]
    fn pause_and_resume_do_not_touch_cursor() {
        let mut cp = channel_checkpoint();
        cp.complete(Some(Snowflake::new(9)));
        cp.pause();
        assert!(cp.is_paused());
        cp.resume().unwrap();
        assert_eq!(cp.status, CheckpointStatus::InProgress);
        assert_eq!(cp.cursor, Some(Snowflake::new(9)));
        assert!(cp.resume().is_err());
    }

    #[test]
    fn reaction_count_tracks_user_set() {
        let key = ReactionKey {
            message_id: Snowflake::new(1),
            emote: EmoteKey::Unicode("👍".to_string()),
        };
        let mut reaction = Reaction::new(key, "👍".to_string());
        assert!(reaction.add_user(Snowflake::new(10)));
        assert!(!reaction.add_user(Snowflake::new(10)));
        assert_eq!(reaction.count(), 1);
        assert!(reaction.remove_user(Snowflake::new(10)));
        assert!(reaction.is_empty());
    }

    #[test]
    fn attachment_transitions_record_attempts_and_clear_state() {
        let mut att = Attachment::new(
            Snowflake::new(1),
            Snowflake::new(2),
            "a.png".to_string(),
            "https://cdn/a.png".to_string(),
        );
        att.mark_downloading();
        att.mark_downloading();
        assert_eq!(att.attempts, 2);
        att.mark_cached("/tmp/a.png".to_string(), "abc".to_string());
        assert!(att.cached);
        assert_eq!(att.status, AttachmentStatus::Completed);
        att.reset_cache();
        assert_eq!(att.status, AttachmentStatus::Pending);
        assert!(att.local_path.is_none() && att.content_hash.is_none());
        att.mark_failed("CDN URL expired".to_string(), false);
        assert!(!att.awaits_download(3));
    }

    #[test]
    fn unknown_wire_codes_fall_back() {
        assert_eq!(ChannelKind::from(99), ChannelKind::Text);
        assert_eq!(MessageKind::from(99), MessageKind::Default);
        assert_eq!(ChannelKind::from(ChannelKind::Forum.code()), ChannelKind::Forum);
        assert!(ChannelKind::PublicThread.holds_messages());
        assert!(!ChannelKind::Category.holds_messages());
        assert!(!ChannelKind::Forum.holds_messages());
    }

    #[test]
    fn emote_keys_round_trip_through_columns() {
        let custom = EmoteKey::Custom(Snowflake::new(55));
        assert_eq!(
            EmoteKey::from_parts(custom.kind(), &custom.value()).unwrap(),
            custom
        );
        assert!(EmoteKey::from_parts("custom", "nope").is_err());
    }
}
