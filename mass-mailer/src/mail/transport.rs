//! Mail transports.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    ChannelSettings, ChannelThrottle, MailTransport, RenderedMail, SendError, TransportReceipt,
};

/// Longest provider body kept as the message response.
const MAX_RESPONSE_LEN: usize = 512;

/// Install the aws-lc-rs rustls provider once per process.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// HTTP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Endpoint receiving one JSON encoded message per request.
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default, alias = "id", alias = "messageId")]
    message_id: Option<String>,
}

/// Classify a relay status code.
///
/// Throttling and server side errors are worth retrying; any other client
/// error means the relay refused this message.
fn classify_status(status: StatusCode, body: &str) -> Result<(), SendError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("{} {}", status.as_u16(), truncate(body));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Err(SendError::Transient(reason))
    } else if status.is_client_error() {
        Err(SendError::Permanent(reason))
    } else {
        Err(SendError::Transient(reason))
    }
}

fn truncate(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= MAX_RESPONSE_LEN {
        return body;
    }
    let mut end = MAX_RESPONSE_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Delivers through an HTTP relay that accepts JSON messages.
pub struct HttpRelayTransport {
    config: RelayConfig,
    client: Client,
    throttle: ChannelThrottle,
}

impl HttpRelayTransport {
    pub fn new(config: RelayConfig, throttle: ChannelThrottle) -> crate::Result<Self> {
        if config.url.trim().is_empty() {
            return Err(crate::Error::config("relay url must not be empty"));
        }
        install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build relay client: {}", e)))?;
        Ok(Self {
            config,
            client,
            throttle,
        })
    }
}

#[async_trait]
impl MailTransport for HttpRelayTransport {
    async fn throttle(&self, channel: &ChannelSettings) {
        self.throttle.acquire(channel).await;
    }

    async fn send(&self, mail: &RenderedMail) -> Result<TransportReceipt, SendError> {
        let mut request = self.client.post(&self.config.url).json(mail);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::transient(format!("relay request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if let Err(err) = classify_status(status, &body) {
            warn!(
                channel_id = mail.send_configuration_id,
                status = status.as_u16(),
                "Relay rejected message: {}",
                err
            );
            return Err(err);
        }

        let message_id = serde_json::from_str::<RelayResponse>(&body)
            .ok()
            .and_then(|r| r.message_id);
        debug!(
            channel_id = mail.send_configuration_id,
            message_id = message_id.as_deref().unwrap_or("-"),
            "Relay accepted message"
        );
        Ok(TransportReceipt {
            response: format!("{} {}", status.as_u16(), truncate(&body)).trim().to_string(),
            message_id,
        })
    }
}

/// Accepts every message without delivering it.
pub struct DryRunTransport {
    throttle: ChannelThrottle,
    sent: AtomicU64,
}

impl DryRunTransport {
    pub fn new(throttle: ChannelThrottle) -> Self {
        Self {
            throttle,
            sent: AtomicU64::new(0),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MailTransport for DryRunTransport {
    async fn throttle(&self, channel: &ChannelSettings) {
        self.throttle.acquire(channel).await;
    }

    async fn send(&self, mail: &RenderedMail) -> Result<TransportReceipt, SendError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % 1000 == 0 {
            info!(
                channel_id = mail.send_configuration_id,
                "Dry-run transport accepted {} messages", n
            );
        }
        Ok(TransportReceipt {
            response: "250 dry-run".to_string(),
            message_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}
