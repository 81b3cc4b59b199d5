//! In-memory table of open playback sessions.
//!
//! Each session carries a per-record writer lock. The gateway's finalize and
//! the flusher's checkpoint both take it before touching the watch record, so
//! writes to one record are serialized while different records never contend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::database::models::{ChannelDbModel, ViewerDbModel, watch_duration_secs};

/// Write state of a session's watch record.
#[derive(Debug, Default)]
pub struct RecordState {
    finalized: bool,
}

impl RecordState {
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }
}

/// Exclusive write access to one session's watch record.
pub type RecordGuard = OwnedMutexGuard<RecordState>;

/// Build the key of a session. Unique per connection because the record id is.
pub fn session_key(viewer_id: i64, channel_id: i64, record_id: i64) -> String {
    format!("{viewer_id}_{channel_id}_{record_id}")
}

/// One open playback connection.
#[derive(Debug)]
pub struct LiveSession {
    pub key: String,
    pub viewer_id: i64,
    pub viewer_name: String,
    pub channel_id: i64,
    /// Channel name at the time playback started.
    pub channel_name: String,
    pub record_id: i64,
    pub started_at: DateTime<Utc>,
    last_checkpoint: Mutex<Option<DateTime<Utc>>>,
    writer: Arc<AsyncMutex<RecordState>>,
}

impl LiveSession {
    pub fn new(
        viewer: &ViewerDbModel,
        channel: &ChannelDbModel,
        record_id: i64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: session_key(viewer.id, channel.id, record_id),
            viewer_id: viewer.id,
            viewer_name: viewer.username.clone(),
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            record_id,
            started_at,
            last_checkpoint: Mutex::new(None),
            writer: Arc::new(AsyncMutex::new(RecordState::default())),
        }
    }

    /// Wait for exclusive write access to the watch record.
    pub async fn lock_record(&self) -> RecordGuard {
        Arc::clone(&self.writer).lock_owned().await
    }

    /// Whole seconds watched as of `now`, never negative.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        watch_duration_secs(self.started_at, now)
    }

    pub fn last_checkpoint(&self) -> Option<DateTime<Utc>> {
        *self.last_checkpoint.lock()
    }

    pub fn mark_checkpoint(&self, at: DateTime<Utc>) {
        *self.last_checkpoint.lock() = Some(at);
    }

    pub fn info(&self, now: DateTime<Utc>) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            viewer_id: self.viewer_id,
            viewer_name: self.viewer_name.clone(),
            channel_id: self.channel_id,
            channel_name: self.channel_name.clone(),
            record_id: self.record_id,
            started_at: self.started_at,
            last_checkpoint: self.last_checkpoint(),
            elapsed_secs: self.elapsed_secs(now),
        }
    }
}

/// Snapshot of a session for operational listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub viewer_id: i64,
    pub viewer_name: String,
    pub channel_id: i64,
    pub channel_name: String,
    pub record_id: i64,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub elapsed_secs: i64,
}

/// Concurrent map of session key to open session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session and return the shared handle.
    pub fn register(&self, session: LiveSession) -> Arc<LiveSession> {
        let session = Arc::new(session);
        if let Some(previous) = self
            .sessions
            .insert(session.key.clone(), Arc::clone(&session))
        {
            warn!(key = %previous.key, "Replaced a session registered under the same key");
        }
        debug!(key = %session.key, active = self.sessions.len(), "Session registered");
        session
    }

    pub fn get(&self, key: &str) -> Option<Arc<LiveSession>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session. Only the first caller for a key gets `Some`.
    pub fn remove(&self, key: &str) -> Option<Arc<LiveSession>> {
        let removed = self.sessions.remove(key).map(|(_, session)| session);
        if removed.is_some() {
            debug!(key, active = self.sessions.len(), "Session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Handles to every open session at this instant.
    pub fn snapshot(&self) -> Vec<Arc<LiveSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Listing of open sessions, oldest first.
    pub fn list(&self, now: DateTime<Utc>) -> Vec<SessionInfo> {
        let mut listing: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info(now))
            .collect();
        listing.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
        listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn viewer(id: i64) -> ViewerDbModel {
        ViewerDbModel {
            id,
            username: format!("viewer{id}"),
            token: Some("abc".to_string()),
            is_active: true,
        }
    }

    fn channel(id: i64) -> ChannelDbModel {
        let mut channel = ChannelDbModel::new(format!("Channel {id}"), "http://upstream/live.ts");
        channel.id = id;
        channel
    }

    #[test]
    fn test_register_get_remove() {
        let registry = SessionRegistry::new();
        let session = registry.register(LiveSession::new(&viewer(1), &channel(7), 10, Utc::now()));
        assert_eq!(session.key, "1_7_10");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("1_7_10").unwrap().record_id, 10);

        assert!(registry.remove("1_7_10").is_some());
        assert!(registry.remove("1_7_10").is_none());
        assert!(registry.remove("never-registered").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_viewer_and_channel_hold_separate_sessions() {
        let registry = SessionRegistry::new();
        let now = Utc::now();
        registry.register(LiveSession::new(&viewer(1), &channel(7), 10, now));
        registry.register(LiveSession::new(&viewer(1), &channel(7), 11, now));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_listing_is_oldest_first() {
        let registry = SessionRegistry::new();
        let now = Utc::now();
        registry.register(LiveSession::new(&viewer(2), &channel(7), 2, now));
        let old = registry.register(LiveSession::new(
            &viewer(1),
            &channel(8),
            1,
            now - Duration::seconds(90),
        ));
        old.mark_checkpoint(now);

        let listing = registry.list(now);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].key, "1_8_1");
        assert_eq!(listing[0].elapsed_secs, 90);
        assert_eq!(listing[0].last_checkpoint, Some(now));
        assert_eq!(listing[0].channel_name, "Channel 8");
        assert_eq!(listing[1].elapsed_secs, 0);
    }

    #[tokio::test]
    async fn test_concurrent_removal_yields_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register(LiveSession::new(&viewer(1), &channel(7), 1, Utc::now()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.remove("1_7_1").is_some() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_record_lock_tracks_finalization() {
        let session = LiveSession::new(&viewer(1), &channel(7), 1, Utc::now());
        {
            let mut guard = session.lock_record().await;
            assert!(!guard.is_finalized());
            guard.mark_finalized();
        }
        assert!(session.lock_record().await.is_finalized());
    }
}
