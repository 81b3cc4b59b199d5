//! Open playback sessions and their watch-time accounting.

pub mod flusher;
pub mod registry;

pub use flusher::{FlushReport, WatchFlusher};
pub use registry::{LiveSession, RecordGuard, RecordState, SessionInfo, SessionRegistry, session_key};
