pub mod error;
pub mod logging;

pub use self::error::SyncError;
