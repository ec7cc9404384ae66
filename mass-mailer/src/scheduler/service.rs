//! Scheduler service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::backoff::ChannelStatusTracker;
use crate::Result;
use crate::database::models::{CampaignStatus, QueueType};
use crate::database::repositories::{CampaignRepository, QueueRepository};
use crate::database::time::{duration_ms, now_ms};
use crate::synchronizer::SyncInbox;

/// Default check period (30 seconds).
pub const DEFAULT_CHECK_PERIOD_MS: u64 = 30_000;

/// Default campaign retention (30 days).
pub const DEFAULT_CAMPAIGN_RETENTION_DAYS: u64 = 30;

/// Default number of queued messages handed off per check.
pub const DEFAULT_QUEUE_BATCH_SIZE: i64 = 1_000;

/// Retention of queued messages, per queue type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRetention {
    pub triggered_hours: u64,
    pub test_hours: u64,
    pub subscription_hours: u64,
    pub api_transactional_hours: u64,
}

impl Default for QueueRetention {
    fn default() -> Self {
        Self {
            triggered_hours: 24,
            test_hours: 1,
            subscription_hours: 24,
            api_transactional_hours: 72,
        }
    }
}

impl QueueRetention {
    pub fn for_type(&self, queue_type: QueueType) -> Duration {
        let hours = match queue_type {
            QueueType::Triggered => self.triggered_hours,
            QueueType::Test => self.test_hours,
            QueueType::Subscription => self.subscription_hours,
            QueueType::ApiTransactional => self.api_transactional_hours,
        };
        Duration::from_secs(hours.saturating_mul(3600))
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Check period in milliseconds.
    pub check_period_ms: u64,
    /// Campaigns that never started within this many days are finished.
    pub campaign_retention_days: u64,
    pub queue_retention: QueueRetention,
    /// Upper bound of queued messages handed off per check.
    pub queue_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_period_ms: DEFAULT_CHECK_PERIOD_MS,
            campaign_retention_days: DEFAULT_CAMPAIGN_RETENTION_DAYS,
            queue_retention: QueueRetention::default(),
            queue_batch_size: DEFAULT_QUEUE_BATCH_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }

    pub fn campaign_retention(&self) -> Duration {
        Duration::from_secs(self.campaign_retention_days.saturating_mul(86_400))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignCheckStats {
    pub finished: u64,
    pub pausing: usize,
    pub claimed: usize,
    /// The check was skipped because another one was running.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCheckStats {
    pub pruned: u64,
    pub channels: usize,
    pub handed_off: usize,
    pub skipped: bool,
}

/// Clears a running flag on drop.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Campaign and queue scheduler.
pub struct Scheduler {
    campaigns: Arc<dyn CampaignRepository>,
    queue: Arc<dyn QueueRepository>,
    tracker: Arc<ChannelStatusTracker>,
    inbox: Arc<SyncInbox>,
    config: SchedulerConfig,
    campaign_check_running: AtomicBool,
    queue_check_running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        queue: Arc<dyn QueueRepository>,
        tracker: Arc<ChannelStatusTracker>,
        inbox: Arc<SyncInbox>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            campaigns,
            queue,
            tracker,
            inbox,
            config,
            campaign_check_running: AtomicBool::new(false),
            queue_check_running: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &Arc<ChannelStatusTracker> {
        &self.tracker
    }

    /// Campaign scheduling pass.
    ///
    /// Finishes expired campaigns, hands PAUSING campaigns to the
    /// synchronizer, then claims due campaigns one transaction at a time
    /// until none is left.
    pub async fn check_campaigns(&self, now: i64) -> Result<CampaignCheckStats> {
        let Some(_guard) = RunningGuard::try_acquire(&self.campaign_check_running) else {
            debug!("Campaign check already running, skipping");
            return Ok(CampaignCheckStats {
                skipped: true,
                ..Default::default()
            });
        };

        let mut stats = CampaignCheckStats::default();
        let cutoff = now.saturating_sub(duration_ms(self.config.campaign_retention()));
        stats.finished = self.campaigns.finish_expired(cutoff).await?;
        if stats.finished > 0 {
            info!(count = stats.finished, "Finished expired campaigns");
        }

        for campaign in self.campaigns.list_by_status(CampaignStatus::Pausing).await? {
            self.inbox.push_pause(campaign.id);
            stats.pausing += 1;
        }

        loop {
            let postponed = self.tracker.postponed_channels(now);
            let Some(campaign) = self.campaigns.claim_next_scheduled(now, &postponed).await? else {
                break;
            };
            info!(
                campaign_id = campaign.id,
                channel_id = campaign.send_configuration_id,
                "Campaign claimed for synchronization"
            );
            self.inbox.push_campaign(campaign.id);
            stats.claimed += 1;
        }

        Ok(stats)
    }

    /// Queue scheduling pass.
    ///
    /// Prunes expired messages per queue type, then hands schedulable
    /// messages of non-postponed channels to the synchronizer grouped by
    /// channel.
    pub async fn check_queue(&self, now: i64) -> Result<QueueCheckStats> {
        let Some(_guard) = RunningGuard::try_acquire(&self.queue_check_running) else {
            debug!("Queue check already running, skipping");
            return Ok(QueueCheckStats {
                skipped: true,
                ..Default::default()
            });
        };

        let mut stats = QueueCheckStats::default();
        for queue_type in QueueType::ALL {
            let retention = self.config.queue_retention.for_type(queue_type);
            let cutoff = now.saturating_sub(duration_ms(retention));
            let pruned = self.queue.prune_expired(queue_type, cutoff).await?;
            if pruned > 0 {
                info!(queue_type = %queue_type, count = pruned, "Pruned expired queued messages");
            }
            stats.pruned += pruned;
        }

        let postponed = self.tracker.postponed_channels(now);
        let messages = self
            .queue
            .list_schedulable(&postponed, self.config.queue_batch_size)
            .await?;

        let mut by_channel: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for message in &messages {
            by_channel
                .entry(message.send_configuration_id)
                .or_default()
                .push(message.id);
        }

        stats.channels = by_channel.len();
        stats.handed_off = messages.len();
        for (channel, ids) in by_channel {
            debug!(channel_id = channel, count = ids.len(), "Queued messages handed off");
            self.inbox.push_queued(channel, ids);
        }

        Ok(stats)
    }

    async fn check_all(&self) {
        let now = now_ms();
        if let Err(e) = self.check_campaigns(now).await {
            error!(error = %e, "Campaign check failed");
        }
        if let Err(e) = self.check_queue(now).await {
            error!(error = %e, "Queue check failed");
        }
    }

    /// Run both checks every check period, and whenever a channel
    /// postponement expires, until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            period_ms = self.config.check_period_ms,
            "Scheduler started"
        );
        let wake = self.tracker.wake_handle();
        let mut interval = tokio::time::interval(self.config.check_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = wake.notified() => {
                    debug!("Channel postponement expired, re-checking");
                }
            }
            self.check_all().await;
        }

        info!("Scheduler stopped");
    }
}
