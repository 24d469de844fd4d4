use thiserror::Error;

use super::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}

pub(super) fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.upstream.api_url.is_empty() {
        return Err(invalid("upstream.api_url cannot be empty"));
    }
    if url::Url::parse(&config.upstream.api_url).is_err() {
        return Err(ConfigError::InvalidConfig(format!(
            "upstream.api_url is not a valid URL: {}",
            config.upstream.api_url
        )));
    }

    if config.database.connection_string().is_empty() {
        return Err(invalid("database connection string cannot be empty"));
    }
    if !config.database.is_sqlite() {
        return Err(invalid(
            "only sqlite databases are supported (database.url must start with sqlite://)",
        ));
    }
    if config.database.max_connections == 0 {
        return Err(invalid("database.max_connections must be at least 1"));
    }

    let sync = &config.sync;
    if sync.message_batch_size == 0 || sync.message_batch_size > 100 {
        return Err(invalid("sync.message_batch_size must be between 1 and 100"));
    }
    if sync.max_messages_per_channel == 0 {
        return Err(invalid("sync.max_messages_per_channel must be at least 1"));
    }
    if sync.member_page_size == 0 || sync.member_page_size > 1000 {
        return Err(invalid("sync.member_page_size must be between 1 and 1000"));
    }
    if sync.reaction_page_size == 0 || sync.reaction_page_size > 100 {
        return Err(invalid("sync.reaction_page_size must be between 1 and 100"));
    }

    let attachments = &config.attachments;
    if attachments.storage_path.as_os_str().is_empty() {
        return Err(invalid("attachments.storage_path cannot be empty"));
    }
    if attachments.max_concurrent_downloads == 0 {
        return Err(invalid("attachments.max_concurrent_downloads must be at least 1"));
    }
    if attachments.max_file_size == 0 {
        return Err(invalid("attachments.max_file_size must be at least 1 byte"));
    }
    if attachments.background_threshold > attachments.max_file_size {
        return Err(invalid(
            "attachments.background_threshold cannot exceed attachments.max_file_size",
        ));
    }
    if attachments.download_timeout_secs == 0 {
        return Err(invalid("attachments.download_timeout_secs must be at least 1"));
    }
    if attachments.worker_batch_size <= 0 {
        return Err(invalid("attachments.worker_batch_size must be positive"));
    }

    if let Some(endpoint) = config.notifications.endpoint.as_deref()
        && url::Url::parse(endpoint).is_err()
    {
        return Err(ConfigError::InvalidConfig(format!(
            "notifications.endpoint is not a valid URL: {endpoint}"
        )));
    }

    Ok(())
}
