//! Viewer credential store.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ViewerDbModel;

/// Token lookup for playback authorization.
#[async_trait]
pub trait ViewerRepository: Send + Sync {
    /// Resolve an active viewer by playback token.
    async fn resolve_viewer_by_token(&self, token: &str) -> Result<Option<ViewerDbModel>>;

    /// Insert a viewer and return its id.
    async fn create(&self, username: &str, token: Option<&str>) -> Result<i64>;
}

/// SQLx implementation of ViewerRepository.
pub struct SqlxViewerRepository {
    pool: SqlitePool,
}

impl SqlxViewerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ViewerRepository for SqlxViewerRepository {
    async fn resolve_viewer_by_token(&self, token: &str) -> Result<Option<ViewerDbModel>> {
        if token.is_empty() {
            return Ok(None);
        }
        let viewer = sqlx::query_as::<_, ViewerDbModel>(
            "SELECT * FROM viewers WHERE token = ? AND is_active = 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(viewer)
    }

    async fn create(&self, username: &str, token: Option<&str>) -> Result<i64> {
        let result = sqlx::query("INSERT INTO viewers (username, token, is_active) VALUES (?, ?, 1)")
            .bind(username)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_resolve_by_token() {
        let repo = SqlxViewerRepository::new(test_pool().await);
        let id = repo.create("alice", Some("abc")).await.unwrap();

        let viewer = repo.resolve_viewer_by_token("abc").await.unwrap().unwrap();
        assert_eq!(viewer.id, id);
        assert_eq!(viewer.username, "alice");

        assert!(repo.resolve_viewer_by_token("nope").await.unwrap().is_none());
        assert!(repo.resolve_viewer_by_token("").await.unwrap().is_none());
    }
}
