//! Database models.

pub mod channel;
pub mod viewer;
pub mod watch_record;

pub use channel::{ChannelDbModel, ChannelHealthSummary};
pub use viewer::ViewerDbModel;
pub use watch_record::{WatchCheckpoint, WatchRecordDbModel, watch_duration_secs};
