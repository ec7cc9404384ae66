//! Campaign and queued message database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::parse_id_list;

/// A recipient of a campaign, one row per subscription the campaign targets.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignMessageDbModel {
    pub id: i64,
    pub campaign_id: i64,
    pub list_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub email: String,
    /// 32-bit piece of the recipient hash used to place the message in a range
    pub hash_email_piece: i64,
    /// Status: SCHEDULED, SENT, FAILED
    pub status: String,
    pub response: Option<String>,
    pub response_id: Option<String>,
    pub updated_at: i64,
}

/// A transactional message waiting in the relational queue.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedMessageDbModel {
    pub id: i64,
    pub send_configuration_id: i64,
    /// Queue type: TRIGGERED, TEST, SUBSCRIPTION, API_TRANSACTIONAL
    pub queue_type: String,
    pub email: String,
    pub hash_email_piece: Option<i64>,
    /// JSON blob with message specific data
    pub data: String,
    /// JSON array of file ids
    pub attachments: String,
    pub status: String,
    /// 1 while the message is held by the operational store
    pub processing: i64,
    pub response: Option<String>,
    pub response_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueuedMessageDbModel {
    pub fn new(send_configuration_id: i64, queue_type: QueueType, email: impl Into<String>) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: 0,
            send_configuration_id,
            queue_type: queue_type.as_str().to_string(),
            email: email.into(),
            hash_email_piece: None,
            data: "{}".to_string(),
            attachments: "[]".to_string(),
            status: MessageStatus::Scheduled.as_str().to_string(),
            processing: 0,
            response: None,
            response_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> Option<QueueType> {
        QueueType::parse(&self.queue_type)
    }

    pub fn attachment_ids(&self) -> crate::Result<Vec<i64>> {
        parse_id_list(&self.attachments)
    }

    pub fn is_processing(&self) -> bool {
        self.processing != 0
    }
}

/// The delivery outcome of one message, replayed from the operational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOutcome {
    /// Row id in `campaign_messages` or `queued_messages`.
    pub source_id: i64,
    /// `Sent` or `Failed`.
    pub status: MessageStatus,
    pub response: Option<String>,
    pub response_id: Option<String>,
}

/// Message status values, shared by both stores.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Due for delivery.
    Scheduled,
    /// Handed to the transport (set before the transport call returns).
    Sent,
    /// Permanently rejected.
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(Self::Scheduled),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Kinds of transactional queue, each with its own retention.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    Triggered,
    Test,
    Subscription,
    ApiTransactional,
}

impl QueueType {
    pub const ALL: [QueueType; 4] = [
        QueueType::Triggered,
        QueueType::Test,
        QueueType::Subscription,
        QueueType::ApiTransactional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "TRIGGERED",
            Self::Test => "TEST",
            Self::Subscription => "SUBSCRIPTION",
            Self::ApiTransactional => "API_TRANSACTIONAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRIGGERED" => Some(Self::Triggered),
            "TEST" => Some(Self::Test),
            "SUBSCRIPTION" => Some(Self::Subscription),
            "API_TRANSACTIONAL" => Some(Self::ApiTransactional),
            _ => None,
        }
    }
}
