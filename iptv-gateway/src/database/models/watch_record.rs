//! Watch record database model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, watch_date};

/// Durable record of one viewing session's time extent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WatchRecordDbModel {
    pub id: i64,
    pub viewer_id: i64,
    pub channel_id: i64,
    /// Unix epoch milliseconds.
    pub start_time: i64,
    /// Unix epoch milliseconds; `None` while the session has never been checkpointed.
    pub end_time: Option<i64>,
    /// Whole seconds between start and end, never negative.
    pub duration: i64,
    /// `YYYY-MM-DD` bucket of `start_time`.
    pub watch_date: String,
}

impl WatchRecordDbModel {
    /// A fresh, open record starting at `start`.
    pub fn open(viewer_id: i64, channel_id: i64, start: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            viewer_id,
            channel_id,
            start_time: datetime_to_ms(start),
            end_time: None,
            duration: 0,
            watch_date: watch_date(start),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.start_time)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.end_time.map(ms_to_datetime)
    }
}

/// Whole seconds from `start` to `end`, clamped at zero so clock skew can
/// never produce a negative duration.
pub fn watch_duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    end.signed_duration_since(start).num_seconds().max(0)
}

/// One in-place update of an open record's end time and duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchCheckpoint {
    pub record_id: i64,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
}

impl WatchCheckpoint {
    pub fn new(record_id: i64, start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            record_id,
            end_time: now,
            duration: watch_duration_secs(start, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_duration_whole_seconds() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let end = start + Duration::milliseconds(42_900);
        assert_eq!(watch_duration_secs(start, end), 42);
    }

    #[test]
    fn test_duration_never_negative_under_skew() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let end = start - Duration::seconds(5);
        assert_eq!(watch_duration_secs(start, end), 0);
        assert_eq!(WatchCheckpoint::new(1, start, end).duration, 0);
    }

    #[test]
    fn test_open_record_buckets_by_start_date() {
        let start = Utc.with_ymd_and_hms(2026, 2, 28, 23, 59, 59).unwrap();
        let record = WatchRecordDbModel::open(3, 7, start);
        assert_eq!(record.watch_date, "2026-02-28");
        assert_eq!(record.end_time, None);
        assert_eq!(record.duration, 0);
        assert_eq!(record.started_at(), start);
    }
}
