//! Channel catalog repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{ChannelDbModel, ChannelHealthSummary};
use crate::database::time::datetime_to_ms;

/// Read-mostly access to the channel catalog.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn get_channel(&self, id: i64) -> Result<Option<ChannelDbModel>>;
    async fn list_active_channels(&self) -> Result<Vec<ChannelDbModel>>;
    /// Record a probe result. The only catalog write the gateway performs.
    async fn update_health(&self, id: i64, healthy: bool, checked_at: DateTime<Utc>) -> Result<()>;
    async fn health_summary(&self) -> Result<ChannelHealthSummary>;
    /// Insert a channel and return its id.
    async fn create(&self, channel: &ChannelDbModel) -> Result<i64>;
}

/// SQLx implementation of ChannelRepository.
pub struct SqlxChannelRepository {
    pool: SqlitePool,
}

impl SqlxChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelRepository for SqlxChannelRepository {
    async fn get_channel(&self, id: i64) -> Result<Option<ChannelDbModel>> {
        let channel = sqlx::query_as::<_, ChannelDbModel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(channel)
    }

    async fn list_active_channels(&self) -> Result<Vec<ChannelDbModel>> {
        let channels = sqlx::query_as::<_, ChannelDbModel>(
            "SELECT * FROM channels WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }

    async fn update_health(&self, id: i64, healthy: bool, checked_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE channels SET is_healthy = ?, last_check = ? WHERE id = ?")
            .bind(healthy)
            .bind(datetime_to_ms(checked_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_summary(&self) -> Result<ChannelHealthSummary> {
        let (total, healthy): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_healthy), 0) FROM channels WHERE is_active = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        let unhealthy_channels = sqlx::query_as::<_, ChannelDbModel>(
            "SELECT * FROM channels WHERE is_active = 1 AND is_healthy = 0 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ChannelHealthSummary {
            total,
            healthy,
            unhealthy: total - healthy,
            unhealthy_channels,
        })
    }

    async fn create(&self, channel: &ChannelDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO channels (name, url, protocol, is_active, is_healthy, last_check)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&channel.name)
        .bind(&channel.url)
        .bind(&channel.protocol)
        .bind(channel.is_active)
        .bind(channel.is_healthy)
        .bind(channel.last_check)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}
