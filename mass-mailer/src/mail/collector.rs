//! Task collector backed by the relational store.

use std::sync::Arc;

use async_trait::async_trait;

use super::{AttachmentRef, ChannelSettings, MailTemplate, TaskBundle, TaskCollector, TaskQuery};
use crate::Result;
use crate::database::models::{FileDbModel, SendConfigurationDbModel};
use crate::database::repositories::{CampaignRepository, SendConfigurationRepository};

impl TryFrom<&SendConfigurationDbModel> for ChannelSettings {
    type Error = crate::Error;

    fn try_from(config: &SendConfigurationDbModel) -> Result<Self> {
        let settings = if config.settings.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&config.settings)?
        };
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            reply_to: config.reply_to.clone(),
            max_per_second: config.max_per_second,
            settings,
        })
    }
}

impl From<&FileDbModel> for AttachmentRef {
    fn from(file: &FileDbModel) -> Self {
        Self {
            id: file.id,
            filename: file.filename.clone(),
            mimetype: file.mimetype.clone(),
            size: file.size,
        }
    }
}

/// Builds task bundles from campaign, channel and file rows.
pub struct RelationalTaskCollector {
    campaigns: Arc<dyn CampaignRepository>,
    channels: Arc<dyn SendConfigurationRepository>,
}

impl RelationalTaskCollector {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        channels: Arc<dyn SendConfigurationRepository>,
    ) -> Self {
        Self {
            campaigns,
            channels,
        }
    }

    async fn attachments(&self, ids: &[i64]) -> Result<Vec<AttachmentRef>> {
        let files = self.channels.get_files(ids).await?;
        Ok(files.iter().map(AttachmentRef::from).collect())
    }
}

#[async_trait]
impl TaskCollector for RelationalTaskCollector {
    async fn collect(&self, query: &TaskQuery) -> Result<TaskBundle> {
        match query {
            TaskQuery::Campaign { campaign_id } => {
                let campaign = self.campaigns.get_campaign(*campaign_id).await?;
                let channel = self
                    .channels
                    .get_send_configuration(campaign.send_configuration_id)
                    .await?;
                Ok(TaskBundle {
                    channel: ChannelSettings::try_from(&channel)?,
                    campaign_id: Some(campaign.id),
                    campaign_name: Some(campaign.name.clone()),
                    lists: campaign.list_ids()?,
                    template: MailTemplate {
                        subject: campaign.subject.clone(),
                        html: campaign.html.clone(),
                        text: campaign.text.clone(),
                    },
                    attachments: self.attachments(&campaign.attachment_ids()?).await?,
                })
            }
            TaskQuery::Queued {
                send_configuration_id,
                attachment_ids,
            } => {
                let channel = self
                    .channels
                    .get_send_configuration(*send_configuration_id)
                    .await?;
                Ok(TaskBundle {
                    channel: ChannelSettings::try_from(&channel)?,
                    campaign_id: None,
                    campaign_name: None,
                    lists: Vec::new(),
                    template: MailTemplate::default(),
                    attachments: self.attachments(attachment_ids).await?,
                })
            }
        }
    }
}
