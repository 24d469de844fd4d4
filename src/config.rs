pub use self::parser::{
    AttachmentConfig, Config, DatabaseConfig, LoggingConfig, NotificationConfig, SyncConfig,
    UpstreamConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
