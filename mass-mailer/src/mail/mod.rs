//! Mail collaborators.
//!
//! The delivery core talks to three collaborators through traits:
//! - [`TaskCollector`] builds the bundle a send task carries (channel
//!   settings, template, attachments)
//! - [`MailComposer`] renders one message of a task
//! - [`MailTransport`] hands a rendered message to the provider, behind a
//!   per-channel throttle gate
//!
//! Delivery failures are classified by [`SendError`] so a sender can tell a
//! channel hiccup from a rejected recipient.

mod collector;
mod composer;
mod throttle;
mod transport;

pub use collector::RelationalTaskCollector;
pub use composer::BundleComposer;
pub use throttle::{ChannelThrottle, ThrottleConfig};
pub use transport::{DryRunTransport, HttpRelayTransport, RelayConfig, install_rustls_provider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operational::MessageKind;

/// Delivery failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The channel may recover; the message is retried later.
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// The message will never be delivered.
    #[error("Permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(reason) | Self::Permanent(reason) => reason,
        }
    }
}

/// Channel settings captured when a task is collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub id: i64,
    pub name: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub max_per_second: Option<f64>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl ChannelSettings {
    /// `"Name <address>"`, or the bare address.
    pub fn from_header(&self) -> String {
        match self.from_name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(name) => format!("{} <{}>", name.trim(), self.from_email),
            None => self.from_email.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailTemplate {
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: i64,
    pub filename: String,
    pub mimetype: Option<String>,
    pub size: i64,
}

/// Everything a sender needs to compose the messages of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBundle {
    pub channel: ChannelSettings,
    pub campaign_id: Option<i64>,
    pub campaign_name: Option<String>,
    #[serde(default)]
    pub lists: Vec<i64>,
    #[serde(default)]
    pub template: MailTemplate,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl TaskBundle {
    pub fn attachment(&self, id: i64) -> Option<&AttachmentRef> {
        self.attachments.iter().find(|a| a.id == id)
    }

    /// Add the attachments of `other` this bundle does not know yet.
    pub fn merge_attachments(&mut self, other: &TaskBundle) {
        for attachment in &other.attachments {
            if self.attachment(attachment.id).is_none() {
                self.attachments.push(attachment.clone());
            }
        }
    }
}

/// What a [`TaskCollector`] is asked to collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskQuery {
    Campaign {
        campaign_id: i64,
    },
    Queued {
        send_configuration_id: i64,
        /// Files referenced by the batch being pushed.
        attachment_ids: Vec<i64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignMail {
    pub message_id: i64,
    pub campaign_id: i64,
    pub list_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMail {
    pub message_id: i64,
    pub kind: MessageKind,
    pub recipient: String,
    /// Per-message data; `subject`, `html` and `text` override the template.
    pub data: serde_json::Value,
    pub attachments: Vec<i64>,
}

/// One message handed to composition, tagged by origin.
#[derive(Debug, Clone, PartialEq)]
pub enum MailItem {
    Campaign(CampaignMail),
    Queued(QueuedMail),
}

impl MailItem {
    pub fn recipient(&self) -> &str {
        match self {
            Self::Campaign(mail) => &mail.recipient,
            Self::Queued(mail) => &mail.recipient,
        }
    }

    pub fn message_id(&self) -> i64 {
        match self {
            Self::Campaign(mail) => mail.message_id,
            Self::Queued(mail) => mail.message_id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Campaign(_) => MessageKind::Campaign,
            Self::Queued(mail) => mail.kind,
        }
    }
}

/// A composed message ready for the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMail {
    pub send_configuration_id: i64,
    pub from: String,
    pub reply_to: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<AttachmentRef>,
}

/// Provider acknowledgement of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    pub response: String,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait TaskCollector: Send + Sync {
    async fn collect(&self, query: &TaskQuery) -> crate::Result<TaskBundle>;
}

#[async_trait]
pub trait MailComposer: Send + Sync {
    async fn compose(
        &self,
        bundle: &TaskBundle,
        item: &MailItem,
    ) -> Result<RenderedMail, SendError>;
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Wait until the channel may send another message.
    async fn throttle(&self, channel: &ChannelSettings);

    async fn send(&self, mail: &RenderedMail) -> Result<TransportReceipt, SendError>;
}
