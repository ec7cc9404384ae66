//! Operational store models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::models::{
    CampaignMessageDbModel, MessageOutcome, MessageStatus, QueueType, QueuedMessageDbModel,
    parse_id_list,
};
use crate::database::time::now_ms;
use crate::mail::{CampaignMail, MailItem, QueuedMail, TaskBundle};
use crate::registry::hash_email_piece;
use crate::{Error, Result};

/// A unit of work pushed by the synchronizer: one campaign, or the queued
/// messages of one channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendTaskDbModel {
    pub id: String,
    /// Kind: CAMPAIGN, QUEUED
    pub kind: String,
    pub campaign_id: Option<i64>,
    pub send_configuration_id: i64,
    /// Status: ACTIVE, PAUSED
    pub status: String,
    /// JSON encoded [`TaskBundle`]
    pub bundle: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SendTaskDbModel {
    pub fn campaign_task_id(campaign_id: i64) -> String {
        format!("campaign:{}", campaign_id)
    }

    pub fn queued_task_id(send_configuration_id: i64) -> String {
        format!("queued:{}", send_configuration_id)
    }

    pub fn for_campaign(campaign_id: i64, bundle: &TaskBundle) -> Result<Self> {
        Self::new(
            Self::campaign_task_id(campaign_id),
            TaskKind::Campaign,
            Some(campaign_id),
            bundle,
        )
    }

    pub fn for_queue(bundle: &TaskBundle) -> Result<Self> {
        Self::new(
            Self::queued_task_id(bundle.channel.id),
            TaskKind::Queued,
            None,
            bundle,
        )
    }

    fn new(id: String, kind: TaskKind, campaign_id: Option<i64>, bundle: &TaskBundle) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            id,
            kind: kind.as_str().to_string(),
            campaign_id,
            send_configuration_id: bundle.channel.id,
            status: TaskStatus::Active.as_str().to_string(),
            bundle: serde_json::to_string(bundle)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn task_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.task_status() == Some(TaskStatus::Active)
    }

    pub fn task_bundle(&self) -> Result<TaskBundle> {
        Ok(serde_json::from_str(&self.bundle)?)
    }
}

/// Send task kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Campaign,
    Queued,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Campaign => "CAMPAIGN",
            Self::Queued => "QUEUED",
        }
    }
}

/// Send task status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    /// Sender workers skip the task's messages.
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// Kind of an outgoing message.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Campaign,
    Triggered,
    Test,
    Subscription,
    ApiTransactional,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Campaign => "CAMPAIGN",
            Self::Triggered => "TRIGGERED",
            Self::Test => "TEST",
            Self::Subscription => "SUBSCRIPTION",
            Self::ApiTransactional => "API_TRANSACTIONAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CAMPAIGN" => Some(Self::Campaign),
            other => QueueType::parse(other).map(Self::from),
        }
    }

    /// Delivery priority class; lower is sent first.
    pub fn priority(&self) -> i64 {
        match self {
            Self::Triggered | Self::ApiTransactional => 0,
            Self::Test | Self::Subscription => 1,
            Self::Campaign => 2,
        }
    }

    pub fn class(&self) -> MessageClass {
        match self {
            Self::Campaign => MessageClass::Campaign,
            _ => MessageClass::Queued,
        }
    }
}

impl From<QueueType> for MessageKind {
    fn from(queue_type: QueueType) -> Self {
        match queue_type {
            QueueType::Triggered => Self::Triggered,
            QueueType::Test => Self::Test,
            QueueType::Subscription => Self::Subscription,
            QueueType::ApiTransactional => Self::ApiTransactional,
        }
    }
}

/// Campaign messages and queued messages are pulled and replayed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Campaign,
    Queued,
}

/// A message waiting for, or holding the result of, delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutgoingMessageDbModel {
    pub id: i64,
    pub task_id: String,
    pub kind: String,
    /// Row id in the relational store
    pub source_id: i64,
    pub campaign_id: Option<i64>,
    pub list_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub send_configuration_id: i64,
    pub priority: i64,
    pub recipient: String,
    pub hash_email_piece: i64,
    /// JSON blob with message specific data
    pub data: String,
    /// JSON array of file ids
    pub attachments: String,
    /// Status: SCHEDULED, SENT, FAILED
    pub status: String,
    pub response: Option<String>,
    pub response_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OutgoingMessageDbModel {
    pub fn from_campaign_message(
        task: &SendTaskDbModel,
        message: &CampaignMessageDbModel,
    ) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            task_id: task.id.clone(),
            kind: MessageKind::Campaign.as_str().to_string(),
            source_id: message.id,
            campaign_id: Some(message.campaign_id),
            list_id: message.list_id,
            subscription_id: message.subscription_id,
            send_configuration_id: task.send_configuration_id,
            priority: MessageKind::Campaign.priority(),
            recipient: message.email.clone(),
            hash_email_piece: message.hash_email_piece,
            data: "{}".to_string(),
            attachments: "[]".to_string(),
            status: MessageStatus::Scheduled.as_str().to_string(),
            response: None,
            response_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_queued_message(
        task: &SendTaskDbModel,
        message: &QueuedMessageDbModel,
    ) -> Result<Self> {
        let queue_type = message.kind().ok_or_else(|| {
            Error::validation(format!(
                "queued message {} has unknown queue type {}",
                message.id, message.queue_type
            ))
        })?;
        let kind = MessageKind::from(queue_type);
        let now = now_ms();
        Ok(Self {
            id: 0,
            task_id: task.id.clone(),
            kind: kind.as_str().to_string(),
            source_id: message.id,
            campaign_id: None,
            list_id: None,
            subscription_id: None,
            send_configuration_id: message.send_configuration_id,
            priority: kind.priority(),
            recipient: message.email.clone(),
            hash_email_piece: message
                .hash_email_piece
                .unwrap_or_else(|| hash_email_piece(&message.email)),
            data: message.data.clone(),
            attachments: message.attachments.clone(),
            status: MessageStatus::Scheduled.as_str().to_string(),
            response: None,
            response_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    pub fn message_status(&self) -> Option<MessageStatus> {
        MessageStatus::parse(&self.status)
    }

    /// Tagged view of the message for composition.
    pub fn to_mail_item(&self) -> Result<MailItem> {
        let kind = self.message_kind().ok_or_else(|| {
            Error::validation(format!("message {} has unknown kind {}", self.id, self.kind))
        })?;

        let item = match kind {
            MessageKind::Campaign => MailItem::Campaign(CampaignMail {
                message_id: self.source_id,
                campaign_id: self.campaign_id.unwrap_or_default(),
                list_id: self.list_id,
                subscription_id: self.subscription_id,
                recipient: self.recipient.clone(),
            }),
            MessageKind::Triggered
            | MessageKind::Test
            | MessageKind::Subscription
            | MessageKind::ApiTransactional => MailItem::Queued(QueuedMail {
                message_id: self.source_id,
                kind,
                recipient: self.recipient.clone(),
                data: serde_json::from_str(&self.data)?,
                attachments: parse_id_list(&self.attachments)?,
            }),
        };
        Ok(item)
    }

    /// Outcome to replay into the relational store, if the message is settled.
    ///
    /// A SENT message without a provider response only counts when the caller
    /// decided it is stale.
    pub fn to_outcome(&self) -> Option<MessageOutcome> {
        let status = match self.message_status()? {
            MessageStatus::Scheduled => return None,
            status => status,
        };
        Some(MessageOutcome {
            source_id: self.source_id,
            status,
            response: self.response.clone(),
            response_id: self.response_id.clone(),
        })
    }
}

/// Outcome of deliveries through one channel during one sender iteration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelOutcome {
    Success,
    Failure,
}

impl ChannelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// A per-channel report written by a sender worker.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelReportDbModel {
    pub id: i64,
    pub send_configuration_id: i64,
    pub worker_id: i64,
    pub outcome: String,
    pub reason: Option<String>,
    pub reported_at: i64,
}

impl ChannelReportDbModel {
    pub fn new(
        send_configuration_id: i64,
        worker_id: i64,
        outcome: ChannelOutcome,
        reason: Option<String>,
        reported_at: i64,
    ) -> Self {
        Self {
            id: 0,
            send_configuration_id,
            worker_id,
            outcome: outcome.as_str().to_string(),
            reason,
            reported_at,
        }
    }

    pub fn channel_outcome(&self) -> Option<ChannelOutcome> {
        ChannelOutcome::parse(&self.outcome)
    }
}

/// Active back-off of a channel, mirrored from the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ChannelPostponementDbModel {
    pub send_configuration_id: i64,
    pub retry_count: i64,
    pub postpone_till: i64,
    pub updated_at: i64,
}

impl ChannelPostponementDbModel {
    pub fn is_active(&self, now: i64) -> bool {
        self.postpone_till > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{ChannelSettings, MailTemplate};

    fn bundle(channel: i64) -> TaskBundle {
        TaskBundle {
            channel: ChannelSettings {
                id: channel,
                name: "main".to_string(),
                from_email: "news@example.com".to_string(),
                from_name: None,
                reply_to: None,
                max_per_second: None,
                settings: serde_json::json!({}),
            },
            campaign_id: None,
            campaign_name: None,
            lists: Vec::new(),
            template: MailTemplate::default(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_priority_classes() {
        assert!(MessageKind::Triggered.priority() < MessageKind::Test.priority());
        assert_eq!(
            MessageKind::ApiTransactional.priority(),
            MessageKind::Triggered.priority()
        );
        assert_eq!(
            MessageKind::Subscription.priority(),
            MessageKind::Test.priority()
        );
        assert_eq!(MessageKind::Campaign.class(), MessageClass::Campaign);
        assert_eq!(MessageKind::Test.class(), MessageClass::Queued);
        assert_eq!(MessageKind::parse("API_TRANSACTIONAL"), Some(MessageKind::ApiTransactional));
    }

    #[test]
    fn test_queued_message_gets_hash_piece() {
        let task = SendTaskDbModel::for_queue(&bundle(3)).unwrap();
        let mut queued = QueuedMessageDbModel::new(3, QueueType::Triggered, "Someone@Example.com");
        queued.id = 11;
        queued.data = r#"{"subject":"Hi"}"#.to_string();

        let msg = OutgoingMessageDbModel::from_queued_message(&task, &queued).unwrap();
        assert_eq!(msg.task_id, "queued:3");
        assert_eq!(msg.hash_email_piece, hash_email_piece("someone@example.com"));
        assert_eq!(msg.priority, 0);

        match msg.to_mail_item().unwrap() {
            MailItem::Queued(mail) => {
                assert_eq!(mail.message_id, 11);
                assert_eq!(mail.kind, MessageKind::Triggered);
                assert_eq!(mail.data["subject"], "Hi");
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_outcome_only_for_settled_messages() {
        let task = SendTaskDbModel::for_campaign(5, &bundle(1)).unwrap();
        let source = CampaignMessageDbModel {
            id: 9,
            campaign_id: 5,
            list_id: Some(1),
            subscription_id: Some(2),
            email: "a@example.com".to_string(),
            hash_email_piece: 77,
            status: "SCHEDULED".to_string(),
            response: None,
            response_id: None,
            updated_at: 0,
        };
        let mut msg = OutgoingMessageDbModel::from_campaign_message(&task, &source);
        assert!(msg.to_outcome().is_none());

        msg.status = "SENT".to_string();
        msg.response = Some("250 OK".to_string());
        let outcome = msg.to_outcome().unwrap();
        assert_eq!(outcome.source_id, 9);
        assert_eq!(outcome.status, MessageStatus::Sent);
    }
}
