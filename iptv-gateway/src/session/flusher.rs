//! Periodic checkpointing of open watch records.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use crate::Result;
use crate::database::models::WatchCheckpoint;
use crate::database::repositories::WatchRecordRepository;
use crate::utils::Clock;

/// Counts from one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub checkpointed: usize,
    /// Sessions dropped because their watch record no longer exists.
    pub repaired: usize,
    /// Sessions open longer than the zombie threshold.
    pub zombies: usize,
}

/// Writes the elapsed time of every open session to its watch record.
pub struct WatchFlusher {
    registry: Arc<SessionRegistry>,
    records: Arc<dyn WatchRecordRepository>,
    clock: Arc<dyn Clock>,
    zombie_threshold: Duration,
}

impl WatchFlusher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        records: Arc<dyn WatchRecordRepository>,
        clock: Arc<dyn Clock>,
        zombie_threshold: Duration,
    ) -> Self {
        Self {
            registry,
            records,
            clock,
            zombie_threshold,
        }
    }

    /// Run one cycle.
    ///
    /// All checkpoints are committed in one batch. On error nothing is
    /// written and every session stays registered for the next cycle.
    pub async fn flush_once(&self) -> Result<FlushReport> {
        let sessions = self.registry.snapshot();
        if sessions.is_empty() {
            return Ok(FlushReport::default());
        }

        // Record locks are taken before any database work so a finalize
        // waiting on one of them never holds a connection we need.
        let mut held = Vec::with_capacity(sessions.len());
        for session in sessions {
            let guard = session.lock_record().await;
            if !guard.is_finalized() {
                held.push((session, guard));
            }
        }
        if held.is_empty() {
            return Ok(FlushReport::default());
        }

        let now = self.clock.now();
        let checkpoints: Vec<WatchCheckpoint> = held
            .iter()
            .map(|(session, _)| WatchCheckpoint::new(session.record_id, session.started_at, now))
            .collect();
        let missing: HashSet<i64> = self
            .records
            .checkpoint_batch(&checkpoints)
            .await?
            .into_iter()
            .collect();

        let zombie_secs = i64::try_from(self.zombie_threshold.as_secs()).unwrap_or(i64::MAX);
        let mut report = FlushReport::default();
        for (session, mut guard) in held {
            if missing.contains(&session.record_id) {
                guard.mark_finalized();
                self.registry.remove(&session.key);
                warn!(
                    key = %session.key,
                    record_id = session.record_id,
                    "Watch record vanished, dropping session"
                );
                report.repaired += 1;
                continue;
            }

            session.mark_checkpoint(now);
            report.checkpointed += 1;

            let elapsed = session.elapsed_secs(now);
            if elapsed > zombie_secs {
                warn!(
                    key = %session.key,
                    viewer = %session.viewer_name,
                    channel = %session.channel_name,
                    elapsed_secs = elapsed,
                    "Probable zombie session"
                );
                report.zombies += 1;
            }
        }

        debug!(
            checkpointed = report.checkpointed,
            repaired = report.repaired,
            zombies = report.zombies,
            "Watch history flushed"
        );
        Ok(report)
    }
}
