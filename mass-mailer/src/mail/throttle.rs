//! Per-channel throttle gate.
//!
//! Token bucket per send configuration. A channel's own `max_per_second`
//! wins over the process wide default; channels with neither are not
//! throttled.

use std::time::Duration;

use tokio::time::Instant;

use dashmap::DashMap;
use tracing::trace;

use super::ChannelSettings;
use crate::{Error, Result};

/// Throttle configuration.
#[derive(Debug, Clone, Default)]
pub struct ThrottleConfig {
    /// Messages per second for channels without their own limit.
    pub default_rate_per_sec: Option<f64>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

fn validate_rate(rps: f64) -> Result<()> {
    if !rps.is_finite() || rps <= 0.0 {
        return Err(Error::config(format!(
            "rate limit must be a positive finite number, got {}",
            rps
        )));
    }
    Ok(())
}

impl TokenBucket {
    /// `rps` must be positive and finite.
    fn with_rps(rps: f64) -> Self {
        // Allow a burst of one second worth of messages, min 1
        let max_tokens = rps.ceil().max(1.0);
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: rps,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take a token, or return how long until one is available.
    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

/// Token buckets keyed by send configuration id.
#[derive(Debug, Default)]
pub struct ChannelThrottle {
    config: ThrottleConfig,
    buckets: DashMap<i64, TokenBucket>,
}

impl ChannelThrottle {
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        if let Some(rps) = config.default_rate_per_sec {
            validate_rate(rps)?;
        }
        Ok(Self {
            config,
            buckets: DashMap::new(),
        })
    }

    fn rate_for(&self, channel: &ChannelSettings) -> Option<f64> {
        channel
            .max_per_second
            .filter(|rps| rps.is_finite() && *rps > 0.0)
            .or(self.config.default_rate_per_sec)
    }

    /// Take a token for `channel` without waiting.
    ///
    /// Returns the wait needed when the bucket is empty.
    pub fn try_acquire(&self, channel: &ChannelSettings) -> std::result::Result<(), Duration> {
        let Some(rps) = self.rate_for(channel) else {
            return Ok(());
        };

        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(channel.id)
            .or_insert_with(|| TokenBucket::with_rps(rps));
        if (bucket.refill_rate - rps).abs() > f64::EPSILON {
            bucket.refill_rate = rps;
            bucket.max_tokens = rps.ceil().max(1.0);
        }
        bucket.try_take(now)
    }

    /// Wait until `channel` may send another message.
    pub async fn acquire(&self, channel: &ChannelSettings) -> Duration {
        let mut total_wait = Duration::ZERO;
        loop {
            // The bucket guard is dropped before sleeping.
            let wait = match self.try_acquire(channel) {
                Ok(()) => return total_wait,
                Err(wait) => wait,
            };
            trace!(channel_id = channel.id, "Channel throttled, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
            total_wait += wait;
        }
    }
}
