//! Viewer database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A viewer that can open playback sessions with its token.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ViewerDbModel {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub is_active: bool,
}
