//! Bundle based mail composer.

use async_trait::async_trait;

use super::{MailComposer, MailItem, RenderedMail, SendError, TaskBundle};

/// Renders messages straight from the task bundle's template.
///
/// Queued messages may override `subject`, `html` and `text` through their
/// data blob. No merge tags are expanded.
#[derive(Debug, Clone, Default)]
pub struct BundleComposer;

impl BundleComposer {
    pub fn new() -> Self {
        Self
    }
}

fn data_str(data: &serde_json::Value, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

#[async_trait]
impl MailComposer for BundleComposer {
    async fn compose(
        &self,
        bundle: &TaskBundle,
        item: &MailItem,
    ) -> Result<RenderedMail, SendError> {
        let recipient = item.recipient().trim();
        if recipient.is_empty() || !recipient.contains('@') {
            return Err(SendError::permanent(format!(
                "invalid recipient address {:?}",
                item.recipient()
            )));
        }

        let template = &bundle.template;
        let mut headers = Vec::new();
        let (subject, html, text, attachments) = match item {
            MailItem::Campaign(mail) => {
                headers.push(("X-Campaign-Id".to_string(), mail.campaign_id.to_string()));
                if let Some(list_id) = mail.list_id {
                    headers.push(("X-List-Id".to_string(), list_id.to_string()));
                }
                if let Some(subscription_id) = mail.subscription_id {
                    headers.push((
                        "X-Subscription-Id".to_string(),
                        subscription_id.to_string(),
                    ));
                }
                (
                    template.subject.clone(),
                    template.html.clone(),
                    template.text.clone(),
                    bundle.attachments.clone(),
                )
            }
            MailItem::Queued(mail) => {
                headers.push(("X-Message-Kind".to_string(), mail.kind.as_str().to_string()));
                let mut attachments = Vec::with_capacity(mail.attachments.len());
                for id in &mail.attachments {
                    let attachment = bundle.attachment(*id).ok_or_else(|| {
                        SendError::permanent(format!("attachment {} is not available", id))
                    })?;
                    attachments.push(attachment.clone());
                }
                (
                    data_str(&mail.data, "subject").unwrap_or_else(|| template.subject.clone()),
                    data_str(&mail.data, "html").or_else(|| template.html.clone()),
                    data_str(&mail.data, "text").or_else(|| template.text.clone()),
                    attachments,
                )
            }
        };

        if html.is_none() && text.is_none() {
            return Err(SendError::permanent(format!(
                "message {} has no body",
                item.message_id()
            )));
        }

        Ok(RenderedMail {
            send_configuration_id: bundle.channel.id,
            from: bundle.channel.from_header(),
            reply_to: bundle.channel.reply_to.clone(),
            recipient: recipient.to_string(),
            subject,
            html,
            text,
            headers,
            attachments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{AttachmentRef, CampaignMail, ChannelSettings, MailTemplate, QueuedMail};
    use crate::operational::MessageKind;

    fn bundle() -> TaskBundle {
        TaskBundle {
            channel: ChannelSettings {
                id: 1,
                name: "main".to_string(),
                from_email: "news@example.com".to_string(),
                from_name: Some("Newsroom".to_string()),
                reply_to: None,
                max_per_second: None,
                settings: serde_json::json!({}),
            },
            campaign_id: Some(3),
            campaign_name: Some("Launch".to_string()),
            lists: vec![1],
            template: MailTemplate {
                subject: "Hello".to_string(),
                html: Some("<p>Hello</p>".to_string()),
                text: None,
            },
            attachments: vec![AttachmentRef {
                id: 10,
                filename: "terms.pdf".to_string(),
                mimetype: Some("application/pdf".to_string()),
                size: 1024,
            }],
        }
    }

    #[tokio::test]
    async fn test_compose_campaign_mail() {
        let item = MailItem::Campaign(CampaignMail {
            message_id: 1,
            campaign_id: 3,
            list_id: Some(1),
            subscription_id: Some(42),
            recipient: " reader@example.com ".to_string(),
        });
        let mail = BundleComposer::new().compose(&bundle(), &item).await.unwrap();
        assert_eq!(mail.from, "Newsroom <news@example.com>");
        assert_eq!(mail.recipient, "reader@example.com");
        assert_eq!(mail.subject, "Hello");
        assert_eq!(mail.attachments.len(), 1);
        assert!(mail.headers.contains(&("X-Subscription-Id".to_string(), "42".to_string())));
    }

    #[tokio::test]
    async fn test_queued_data_overrides_template() {
        let item = MailItem::Queued(QueuedMail {
            message_id: 5,
            kind: MessageKind::Triggered,
            recipient: "user@example.com".to_string(),
            data: serde_json::json!({"subject": "Your receipt", "text": "Thanks"}),
            attachments: vec![10],
        });
        let mail = BundleComposer::new().compose(&bundle(), &item).await.unwrap();
        assert_eq!(mail.subject, "Your receipt");
        assert_eq!(mail.text.as_deref(), Some("Thanks"));
        assert_eq!(mail.html.as_deref(), Some("<p>Hello</p>"));
        assert_eq!(mail.attachments[0].filename, "terms.pdf");
    }

    #[tokio::test]
    async fn test_compose_failures_are_permanent() {
        let composer = BundleComposer::new();
        let bad_recipient = MailItem::Campaign(CampaignMail {
            message_id: 1,
            campaign_id: 3,
            list_id: None,
            subscription_id: None,
            recipient: "not-an-address".to_string(),
        });
        let err = composer.compose(&bundle(), &bad_recipient).await.unwrap_err();
        assert!(!err.is_transient());

        let missing_file = MailItem::Queued(QueuedMail {
            message_id: 2,
            kind: MessageKind::Test,
            recipient: "user@example.com".to_string(),
            data: serde_json::json!({}),
            attachments: vec![99],
        });
        let err = composer.compose(&bundle(), &missing_file).await.unwrap_err();
        assert_eq!(err, SendError::permanent("attachment 99 is not available"));
    }
}
