//! Send configuration (channel) and file models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A send configuration: the channel messages are delivered through.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendConfigurationDbModel {
    pub id: i64,
    pub name: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub max_per_second: Option<f64>,
    /// JSON blob with transport specific settings
    pub settings: String,
    pub created_at: i64,
}

/// An uploaded file that campaigns and queued messages can attach.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileDbModel {
    pub id: i64,
    pub filename: String,
    pub mimetype: Option<String>,
    pub size: i64,
    /// Number of in-flight queued messages referencing the file
    pub locked: i64,
    pub created_at: i64,
}
