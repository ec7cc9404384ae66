//! Campaign database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::parse_id_list;

/// Campaign database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignDbModel {
    pub id: i64,
    pub name: String,
    /// Status: SCHEDULED, SYNCHRONIZING, SENDING, PAUSING, PAUSED, FINISHED
    pub status: String,
    pub send_configuration_id: i64,
    /// Unix epoch milliseconds at which sending may begin
    pub start_at: i64,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    /// JSON array of list ids
    pub lists: String,
    /// JSON array of file ids
    pub attachments: String,
    pub delivered: i64,
    pub failed: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CampaignDbModel {
    pub fn new(
        name: impl Into<String>,
        send_configuration_id: i64,
        start_at: i64,
        subject: impl Into<String>,
    ) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: 0,
            name: name.into(),
            status: CampaignStatus::Scheduled.as_str().to_string(),
            send_configuration_id,
            start_at,
            subject: subject.into(),
            html: None,
            text: None,
            lists: "[]".to_string(),
            attachments: "[]".to_string(),
            delivered: 0,
            failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn campaign_status(&self) -> Option<CampaignStatus> {
        CampaignStatus::parse(&self.status)
    }

    pub fn list_ids(&self) -> crate::Result<Vec<i64>> {
        parse_id_list(&self.lists)
    }

    pub fn attachment_ids(&self) -> crate::Result<Vec<i64>> {
        parse_id_list(&self.attachments)
    }
}

/// Campaign status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    /// Created and waiting for its start time.
    Scheduled,
    /// Claimed by the scheduler; its messages are being copied to the operational store.
    Synchronizing,
    /// At least one deliverable message exists in the operational store.
    Sending,
    /// Pause requested; waiting for the operational task to be paused.
    Pausing,
    Paused,
    Finished,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Synchronizing => "SYNCHRONIZING",
            Self::Sending => "SENDING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Finished => "FINISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(Self::Scheduled),
            "SYNCHRONIZING" => Some(Self::Synchronizing),
            "SENDING" => Some(Self::Sending),
            "PAUSING" => Some(Self::Pausing),
            "PAUSED" => Some(Self::Paused),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Whether the campaign state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Scheduled, Synchronizing)
                | (Scheduled, Finished)
                | (Synchronizing, Sending)
                | (Synchronizing, Finished)
                | (Synchronizing, Pausing)
                | (Sending, Pausing)
                | (Sending, Finished)
                | (Pausing, Paused)
                | (Paused, Scheduled)
                | (Paused, Finished)
        )
    }
}
