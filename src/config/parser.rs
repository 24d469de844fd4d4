use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ConfigError;
use super::validator;
use crate::snowflake::Snowflake;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub attachments: AttachmentConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn is_sqlite(&self) -> bool {
        let url = self.connection_string();
        url.starts_with("sqlite://") || url.ends_with(".db") || url.ends_with(".sqlite")
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if !self.is_sqlite() {
            return None;
        }
        let url = self.connection_string();
        Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            show_target: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Communities synced when the CLI is not given explicit ids.
    #[serde(default)]
    pub communities: Vec<Snowflake>,
    #[serde(default = "default_message_batch_size")]
    pub message_batch_size: u32,
    #[serde(default = "default_max_messages_per_channel")]
    pub max_messages_per_channel: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_member_page_size")]
    pub member_page_size: u32,
    #[serde(default = "default_reaction_page_size")]
    pub reaction_page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            communities: Vec::new(),
            message_batch_size: default_message_batch_size(),
            max_messages_per_channel: default_max_messages_per_channel(),
            request_delay_ms: default_request_delay_ms(),
            member_page_size: default_member_page_size(),
            reaction_page_size: default_reaction_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachmentConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_true")]
    pub auto_download: bool,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_background_threshold")]
    pub background_threshold: u64,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,
    /// Content-type prefixes; empty means everything not blocked is allowed.
    #[serde(default)]
    pub allowed_content_types: Vec<String>,
    #[serde(default)]
    pub blocked_content_types: Vec<String>,
    #[serde(default = "default_true")]
    pub deduplicate_by_hash: bool,
    /// Zero disables the grace period for orphaned files.
    #[serde(default = "default_orphan_retention_days")]
    pub orphan_retention_days: u64,
    #[serde(default = "default_worker_poll_interval_secs")]
    pub worker_poll_interval_secs: u64,
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: i64,
    #[serde(default = "default_stale_in_progress_secs")]
    pub stale_in_progress_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            auto_download: true,
            max_file_size: default_max_file_size(),
            background_threshold: default_background_threshold(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            download_timeout_secs: default_download_timeout_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            download_delay_ms: default_download_delay_ms(),
            allowed_content_types: Vec::new(),
            blocked_content_types: Vec::new(),
            deduplicate_by_hash: true,
            orphan_retention_days: default_orphan_retention_days(),
            worker_poll_interval_secs: default_worker_poll_interval_secs(),
            worker_batch_size: default_worker_batch_size(),
            stale_in_progress_secs: default_stale_in_progress_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_notification_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_notification_timeout_ms(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_yaml(&content, |key| std::env::var(key).ok())
    }

    fn from_yaml<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides(lookup);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validator::validate(self)
    }

    fn normalize(&mut self) {
        self.upstream.token = self.upstream.token.trim().to_string();
        self.upstream.api_url = self.upstream.api_url.trim_end_matches('/').to_string();
        for entry in self
            .attachments
            .allowed_content_types
            .iter_mut()
            .chain(self.attachments.blocked_content_types.iter_mut())
        {
            *entry = entry.trim().to_ascii_lowercase();
        }
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MIRROR_UPSTREAM_TOKEN") {
            self.upstream.token = value;
        }
        if let Some(value) = lookup("MIRROR_UPSTREAM_API_URL") {
            self.upstream.api_url = value;
        }
        if let Some(value) = lookup("MIRROR_DATABASE_URL") {
            self.database.url = Some(value);
        }
        if let Some(value) = lookup("MIRROR_NOTIFICATIONS_ENDPOINT") {
            self.notifications.endpoint = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup("MIRROR_ATTACHMENTS_STORAGE_PATH") {
            self.attachments.storage_path = PathBuf::from(value);
        }
    }
}

fn default_api_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_user_agent() -> String {
    concat!("community-mirror/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_message_batch_size() -> u32 {
    100
}

fn default_max_messages_per_channel() -> usize {
    10_000
}

fn default_request_delay_ms() -> u64 {
    500
}

fn default_member_page_size() -> u32 {
    1_000
}

fn default_reaction_page_size() -> u32 {
    100
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./attachments")
}

fn default_true() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_background_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_download_delay_ms() -> u64 {
    100
}

fn default_orphan_retention_days() -> u64 {
    30
}

fn default_worker_poll_interval_secs() -> u64 {
    30
}

fn default_worker_batch_size() -> i64 {
    50
}

fn default_stale_in_progress_secs() -> u64 {
    15 * 60
}

fn default_reconcile_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_notification_timeout_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const MINIMAL: &str = r#"
upstream:
  token: "  abc.def  "
database:
  filename: mirror.db
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn minimal_config_gets_documented_defaults() {
        let config = Config::from_yaml(MINIMAL, no_env).unwrap();
        assert_eq!(config.upstream.token, "abc.def");
        assert_eq!(config.sync.message_batch_size, 100);
        assert_eq!(config.sync.max_messages_per_channel, 10_000);
        assert_eq!(config.sync.request_delay_ms, 500);
        assert_eq!(config.attachments.max_concurrent_downloads, 3);
        assert_eq!(config.attachments.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.attachments.max_retry_attempts, 3);
        assert_eq!(config.attachments.orphan_retention_days, 30);
        assert!(config.attachments.deduplicate_by_hash);
        assert_eq!(config.database.sqlite_path().as_deref(), Some("mirror.db"));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MIRROR_UPSTREAM_TOKEN", "from-env"),
            ("MIRROR_DATABASE_URL", "sqlite:///tmp/other.db"),
        ]);
        let config =
            Config::from_yaml(MINIMAL, |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.upstream.token, "from-env");
        assert_eq!(config.database.sqlite_path().as_deref(), Some("/tmp/other.db"));
    }

    #[test]
    fn content_type_lists_are_normalized() {
        let yaml = format!(
            "{MINIMAL}attachments:\n  blocked_content_types: [\" Application/X-Msdownload \"]\n"
        );
        let config = Config::from_yaml(&yaml, no_env).unwrap();
        assert_eq!(
            config.attachments.blocked_content_types,
            vec!["application/x-msdownload".to_string()]
        );
    }

    #[test]
    fn community_ids_accept_strings_and_numbers() {
        let yaml = format!("{MINIMAL}sync:\n  communities: [\"81384788765712384\", 42]\n");
        let config = Config::from_yaml(&yaml, no_env).unwrap();
        assert_eq!(
            config.sync.communities,
            vec![Snowflake::new(81_384_788_765_712_384), Snowflake::new(42)]
        );
    }
}
