//! Activity log model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An audit entry written alongside campaign and queue state changes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ActivityLogDbModel {
    pub id: String,
    /// Entity type: CAMPAIGN, QUEUED_MESSAGE
    pub entity_type: String,
    pub entity_id: i64,
    pub activity: String,
    /// Optional JSON payload
    pub data: Option<String>,
    pub created_at: i64,
}

impl ActivityLogDbModel {
    pub fn new(entity_type: &str, entity_id: i64, activity: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            activity: activity.into(),
            data: None,
            created_at: crate::database::time::now_ms(),
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

pub const ENTITY_CAMPAIGN: &str = "CAMPAIGN";
pub const ENTITY_QUEUED_MESSAGE: &str = "QUEUED_MESSAGE";
