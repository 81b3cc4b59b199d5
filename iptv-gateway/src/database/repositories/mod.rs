//! Repository layer for database access.

pub mod channel;
pub mod settings;
pub mod viewer;
pub mod watch_record;

pub use channel::{ChannelRepository, SqlxChannelRepository};
pub use settings::{SettingsRepository, SqlxSettingsRepository};
pub use viewer::{SqlxViewerRepository, ViewerRepository};
pub use watch_record::{SqlxWatchRecordRepository, WatchRecordRepository};
