//! Session finalization and the drop guard that guarantees it.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::database::repositories::WatchRecordRepository;
use crate::session::SessionRegistry;
use crate::utils::Clock;

/// Closes sessions: removes them from the registry and finalizes their watch record.
#[derive(Clone)]
pub struct SessionFinalizer {
    registry: Arc<SessionRegistry>,
    records: Arc<dyn WatchRecordRepository>,
    clock: Arc<dyn Clock>,
}

impl SessionFinalizer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        records: Arc<dyn WatchRecordRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            records,
            clock,
        }
    }

    /// Finalize the session under `key`.
    ///
    /// Only the caller that removes the key from the registry writes the
    /// record. Returns the final duration in seconds, or `None` if the session
    /// was already closed or its record could not be written.
    pub async fn finalize(&self, key: &str) -> Option<i64> {
        let session = self.registry.remove(key)?;

        let mut record = session.lock_record().await;
        if record.is_finalized() {
            return None;
        }
        record.mark_finalized();

        let end = self.clock.now();
        match self.records.finalize(session.record_id, end).await {
            Ok(Some(duration)) => {
                info!(
                    key,
                    viewer = %session.viewer_name,
                    channel = %session.channel_name,
                    duration_secs = duration,
                    "Session finished"
                );
                Some(duration)
            }
            Ok(None) => {
                warn!(key, record_id = session.record_id, "Watch record vanished before finalize");
                None
            }
            Err(e) => {
                error!(key, record_id = session.record_id, error = %e, "Failed to finalize watch record");
                None
            }
        }
    }

    /// Finalize every registered session. Returns how many were closed.
    pub async fn finalize_all(&self) -> usize {
        let mut closed = 0;
        for session in self.registry.snapshot() {
            if self.finalize(&session.key).await.is_some() {
                closed += 1;
            }
        }
        closed
    }
}

/// Ownership of an open session.
///
/// Call [`SessionLease::release`] to finalize inline. If the lease is dropped
/// without it, finalization is spawned onto the current runtime.
pub struct SessionLease {
    finalizer: SessionFinalizer,
    key: String,
    released: bool,
}

impl SessionLease {
    pub fn new(finalizer: SessionFinalizer, key: String) -> Self {
        Self {
            finalizer,
            key,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Option<i64> {
        self.released = true;
        self.finalizer.finalize(&self.key).await
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let finalizer = self.finalizer.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    finalizer.finalize(&key).await;
                });
            }
            Err(_) => warn!(key, "No runtime available to finalize session"),
        }
    }
}
