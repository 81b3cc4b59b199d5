//! Watch record repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{WatchCheckpoint, WatchRecordDbModel, watch_duration_secs};
use crate::database::retry::BusyRetry;
use crate::database::time::datetime_to_ms;

/// Durable store for watch records.
#[async_trait]
pub trait WatchRecordRepository: Send + Sync {
    /// Insert an open record (end = NULL, duration = 0) and return its id.
    async fn create_open(&self, viewer_id: i64, channel_id: i64, start: DateTime<Utc>) -> Result<i64>;

    async fn get(&self, id: i64) -> Result<Option<WatchRecordDbModel>>;

    /// Close a record at `end`. Returns the stored duration, or `None` when the
    /// record no longer exists.
    async fn finalize(&self, id: i64, end: DateTime<Utc>) -> Result<Option<i64>>;

    /// Apply every checkpoint in one transaction.
    ///
    /// Returns the ids of records that no longer exist. On error nothing is
    /// committed.
    async fn checkpoint_batch(&self, checkpoints: &[WatchCheckpoint]) -> Result<Vec<i64>>;

    async fn delete(&self, id: i64) -> Result<()>;
}

/// SQLx implementation of WatchRecordRepository.
pub struct SqlxWatchRecordRepository {
    pool: SqlitePool,
}

impl SqlxWatchRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn apply_batch(&self, checkpoints: &[WatchCheckpoint]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut missing = Vec::new();

        for checkpoint in checkpoints {
            let result =
                sqlx::query("UPDATE watch_history SET end_time = ?, duration = ? WHERE id = ?")
                    .bind(datetime_to_ms(checkpoint.end_time))
                    .bind(checkpoint.duration)
                    .bind(checkpoint.record_id)
                    .execute(&mut *tx)
                    .await?;
            if result.rows_affected() == 0 {
                missing.push(checkpoint.record_id);
            }
        }

        tx.commit().await?;
        Ok(missing)
    }
}

#[async_trait]
impl WatchRecordRepository for SqlxWatchRecordRepository {
    async fn create_open(&self, viewer_id: i64, channel_id: i64, start: DateTime<Utc>) -> Result<i64> {
        let record = WatchRecordDbModel::open(viewer_id, channel_id, start);
        let result = sqlx::query(
            r#"
            INSERT INTO watch_history (viewer_id, channel_id, start_time, end_time, duration, watch_date)
            VALUES (?, ?, ?, NULL, 0, ?)
            "#,
        )
        .bind(record.viewer_id)
        .bind(record.channel_id)
        .bind(record.start_time)
        .bind(&record.watch_date)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<WatchRecordDbModel>> {
        let record =
            sqlx::query_as::<_, WatchRecordDbModel>("SELECT * FROM watch_history WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn finalize(&self, id: i64, end: DateTime<Utc>) -> Result<Option<i64>> {
        BusyRetry::FINALIZE.run("finalize_watch_record", || async move {
            let Some(record) = self.get(id).await? else {
                return Ok(None);
            };
            let duration = watch_duration_secs(record.started_at(), end);
            let result =
                sqlx::query("UPDATE watch_history SET end_time = ?, duration = ? WHERE id = ?")
                    .bind(datetime_to_ms(end))
                    .bind(duration)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            Ok((result.rows_affected() > 0).then_some(duration))
        })
        .await
    }

    async fn checkpoint_batch(&self, checkpoints: &[WatchCheckpoint]) -> Result<Vec<i64>> {
        if checkpoints.is_empty() {
            return Ok(Vec::new());
        }
        BusyRetry::CHECKPOINT
            .run("checkpoint_watch_records", || self.apply_batch(checkpoints))
            .await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM watch_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
