//! Synchronizer service.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::inbox::{SyncInbox, SyncWork};
use crate::database::models::{CampaignStatus, MessageOutcome};
use crate::database::repositories::{CampaignRepository, QueueRepository};
use crate::database::time::{duration_ms, now_ms};
use crate::mail::{TaskCollector, TaskQuery};
use crate::operational::{
    ChannelOutcome, ChannelPostponementDbModel, MessageClass, OperationalStore,
    OutgoingMessageDbModel, SendTaskDbModel, TaskKind, TaskStatus,
};
use crate::scheduler::{ChannelStatus, ChannelStatusTracker};
use crate::{Error, Result};

/// Default replay chunk size.
pub const DEFAULT_SYNC_CHUNK_SIZE: i64 = 100;

/// Default poll period when no work is pushed (5 seconds).
pub const DEFAULT_SYNC_POLL_MS: u64 = 5_000;

/// Default age after which a SENT message without a response is replayed (10 minutes).
pub const DEFAULT_STALE_SENT_SECS: u64 = 600;

/// Campaign messages pushed per operational transaction.
const PUSH_BATCH_SIZE: usize = 1_000;

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Messages replayed per chunk.
    pub chunk_size: i64,
    /// Pass period when nothing is pushed, in milliseconds.
    pub poll_ms: u64,
    /// SENT messages without a provider response older than this are
    /// replayed as sent.
    pub stale_sent_secs: u64,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_SYNC_CHUNK_SIZE,
            poll_ms: DEFAULT_SYNC_POLL_MS,
            stale_sent_secs: DEFAULT_STALE_SENT_SECS,
        }
    }
}

impl SynchronizerConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub campaigns_pushed: usize,
    pub campaigns_paused: usize,
    pub campaigns_finished: usize,
    pub queued_pushed: usize,
    pub outcomes_applied: u64,
    pub messages_replayed: usize,
    pub channel_reports: usize,
}

impl SyncStats {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Synchronizer {
    campaigns: Arc<dyn CampaignRepository>,
    queue: Arc<dyn QueueRepository>,
    ops: Arc<dyn OperationalStore>,
    collector: Arc<dyn TaskCollector>,
    tracker: Arc<ChannelStatusTracker>,
    inbox: Arc<SyncInbox>,
    config: SynchronizerConfig,
}

impl Synchronizer {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        queue: Arc<dyn QueueRepository>,
        ops: Arc<dyn OperationalStore>,
        collector: Arc<dyn TaskCollector>,
        tracker: Arc<ChannelStatusTracker>,
        inbox: Arc<SyncInbox>,
        config: SynchronizerConfig,
    ) -> Self {
        Self {
            campaigns,
            queue,
            ops,
            collector,
            tracker,
            inbox,
            config,
        }
    }

    /// Pick up work a previous process left half done.
    ///
    /// Campaigns still SYNCHRONIZING or PAUSING are pushed again and channel
    /// postponements are restored into the back-off tracker.
    pub async fn recover(&self, now: i64) -> Result<usize> {
        let mut recovered = 0;
        for campaign in self
            .campaigns
            .list_by_status(CampaignStatus::Synchronizing)
            .await?
        {
            self.inbox.push_campaign(campaign.id);
            recovered += 1;
        }
        for campaign in self.campaigns.list_by_status(CampaignStatus::Pausing).await? {
            self.inbox.push_pause(campaign.id);
            recovered += 1;
        }

        for row in self.ops.list_channel_postponements().await? {
            let status = ChannelStatus {
                retry_count: u32::try_from(row.retry_count).unwrap_or(0),
                postpone_till: row.postpone_till,
            };
            self.tracker.restore(row.send_configuration_id, status, now);
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered unfinished campaign work");
        }
        Ok(recovered)
    }

    /// One pass over pushed work, outcomes and channel reports.
    pub async fn sync_once(&self, now: i64) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let work = self.inbox.take();
        let mut retry = SyncWork::default();

        for campaign_id in work.pausing {
            match self.pause_campaign(campaign_id).await {
                Ok(true) => stats.campaigns_paused += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(campaign_id, error = %e, "Failed to pause campaign");
                    retry.pausing.insert(campaign_id);
                }
            }
        }

        for campaign_id in work.campaigns {
            match self.push_campaign(campaign_id).await {
                Ok(true) => stats.campaigns_pushed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(campaign_id, error = %e, "Failed to push campaign");
                    retry.campaigns.insert(campaign_id);
                }
            }
        }

        // Failed queued batches are released and handed off again by the
        // next queue check.
        for (channel, ids) in work.queued {
            match self.push_queued(channel, &ids).await {
                Ok(pushed) => stats.queued_pushed += pushed,
                Err(e) => error!(channel_id = channel, error = %e, "Failed to push queued messages"),
            }
        }

        self.inbox.requeue(retry);

        for class in [MessageClass::Campaign, MessageClass::Queued] {
            let (replayed, applied) = self.replay_outcomes(class, now).await?;
            stats.messages_replayed += replayed;
            stats.outcomes_applied += applied;
        }

        stats.campaigns_finished = self.finish_drained_campaigns().await?;
        stats.channel_reports = self.apply_channel_reports(now).await?;

        Ok(stats)
    }

    /// Push a SYNCHRONIZING campaign's due messages as one task.
    ///
    /// The campaign moves to SENDING, or straight to FINISHED when nothing is
    /// left to send.
    pub async fn push_campaign(&self, campaign_id: i64) -> Result<bool> {
        let campaign = self.campaigns.get_campaign(campaign_id).await?;
        if campaign.campaign_status() != Some(CampaignStatus::Synchronizing) {
            debug!(
                campaign_id,
                status = %campaign.status,
                "Campaign no longer synchronizing, skipping push"
            );
            return Ok(false);
        }

        let bundle = self
            .collector
            .collect(&TaskQuery::Campaign { campaign_id })
            .await?;
        let task = SendTaskDbModel::for_campaign(campaign_id, &bundle)?;
        let messages = self.campaigns.list_scheduled_messages(campaign_id).await?;
        let outgoing: Vec<OutgoingMessageDbModel> = messages
            .iter()
            .map(|m| OutgoingMessageDbModel::from_campaign_message(&task, m))
            .collect();

        let mut inserted = 0;
        if outgoing.is_empty() {
            self.ops.push_task(&task, &[]).await?;
        }
        for chunk in outgoing.chunks(PUSH_BATCH_SIZE) {
            inserted += self.ops.push_task(&task, chunk).await?.inserted;
        }

        if self.ops.count_task_messages(&task.id).await? > 0 {
            self.campaigns
                .transition(campaign_id, CampaignStatus::Synchronizing, CampaignStatus::Sending)
                .await?;
            info!(campaign_id, inserted, "Campaign pushed to the operational store");
        } else {
            self.campaigns
                .transition(campaign_id, CampaignStatus::Synchronizing, CampaignStatus::Finished)
                .await?;
            self.ops.delete_task(&task.id).await?;
            info!(campaign_id, "Campaign has nothing to send, finished");
        }
        Ok(true)
    }

    /// Pause a PAUSING campaign: its task is paused before the campaign
    /// becomes PAUSED.
    pub async fn pause_campaign(&self, campaign_id: i64) -> Result<bool> {
        let campaign = self.campaigns.get_campaign(campaign_id).await?;
        if campaign.campaign_status() != Some(CampaignStatus::Pausing) {
            return Ok(false);
        }

        let task_id = SendTaskDbModel::campaign_task_id(campaign_id);
        if !self.ops.set_task_status(&task_id, TaskStatus::Paused).await? {
            debug!(campaign_id, "Pausing campaign without an operational task");
        }
        let paused = self
            .campaigns
            .transition(campaign_id, CampaignStatus::Pausing, CampaignStatus::Paused)
            .await?;
        if paused {
            info!(campaign_id, "Campaign paused");
        }
        Ok(paused)
    }

    /// Claim and push one channel's batch of queued messages.
    ///
    /// Messages are released again if the push fails.
    pub async fn push_queued(&self, channel: i64, ids: &BTreeSet<i64>) -> Result<usize> {
        let ids: Vec<i64> = ids.iter().copied().collect();
        let claimed = self.queue.claim_for_sync(&ids).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let pushed = async {
            let mut attachment_ids = BTreeSet::new();
            for message in &claimed {
                attachment_ids.extend(message.attachment_ids()?);
            }
            let mut bundle = self
                .collector
                .collect(&TaskQuery::Queued {
                    send_configuration_id: channel,
                    attachment_ids: attachment_ids.into_iter().collect(),
                })
                .await?;

            // Messages still waiting in the task reference the previous bundle's files.
            let task_id = SendTaskDbModel::queued_task_id(channel);
            if let Some(existing) = self.ops.get_task(&task_id).await? {
                match existing.task_bundle() {
                    Ok(previous) => bundle.merge_attachments(&previous),
                    Err(e) => warn!(channel_id = channel, error = %e, "Ignoring unreadable task bundle"),
                }
            }

            let task = SendTaskDbModel::for_queue(&bundle)?;
            let outgoing = claimed
                .iter()
                .map(|m| OutgoingMessageDbModel::from_queued_message(&task, m))
                .collect::<Result<Vec<_>>>()?;
            self.ops.push_task(&task, &outgoing).await?;
            Ok::<usize, Error>(outgoing.len())
        }
        .await;

        match pushed {
            Ok(count) => {
                debug!(channel_id = channel, count, "Queued messages pushed");
                Ok(count)
            }
            Err(e) => {
                let claimed_ids: Vec<i64> = claimed.iter().map(|m| m.id).collect();
                if let Err(release_err) = self.queue.release_processing(&claimed_ids).await {
                    error!(
                        channel_id = channel,
                        error = %release_err,
                        "Failed to release queued messages after push failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Replay settled messages of `class` into the relational store in
    /// chunks, then delete them from the operational store.
    ///
    /// Returns `(replayed, applied)`: messages removed from the operational
    /// store and relational rows actually updated.
    pub async fn replay_outcomes(&self, class: MessageClass, now: i64) -> Result<(usize, u64)> {
        let stale_before =
            now.saturating_sub(duration_ms(Duration::from_secs(self.config.stale_sent_secs)));
        let chunk_size = self.config.chunk_size.max(1);
        let mut replayed = 0usize;
        let mut applied = 0u64;

        loop {
            let done = self
                .ops
                .fetch_completed(class, stale_before, chunk_size)
                .await?;
            if done.is_empty() {
                break;
            }

            match class {
                MessageClass::Campaign => {
                    let mut by_campaign: BTreeMap<i64, Vec<MessageOutcome>> = BTreeMap::new();
                    for message in &done {
                        let (Some(campaign_id), Some(outcome)) =
                            (message.campaign_id, message.to_outcome())
                        else {
                            warn!(
                                message_id = message.id,
                                source_id = message.source_id,
                                campaign_id = ?message.campaign_id,
                                status = %message.status,
                                "Dropping campaign message without campaign or outcome"
                            );
                            continue;
                        };
                        by_campaign.entry(campaign_id).or_default().push(outcome);
                    }
                    for (campaign_id, outcomes) in by_campaign {
                        applied += self.campaigns.apply_outcomes(campaign_id, &outcomes).await?;
                    }
                }
                MessageClass::Queued => {
                    let mut outcomes = Vec::with_capacity(done.len());
                    for message in &done {
                        match message.to_outcome() {
                            Some(outcome) => outcomes.push(outcome),
                            None => warn!(
                                message_id = message.id,
                                source_id = message.source_id,
                                status = %message.status,
                                "Dropping queued message without outcome"
                            ),
                        }
                    }
                    applied += self.queue.apply_outcomes(&outcomes).await?;
                }
            }

            let ids: Vec<i64> = done.iter().map(|m| m.id).collect();
            self.ops.delete_messages(&ids).await?;
            replayed += done.len();

            if (done.len() as i64) < chunk_size {
                break;
            }
        }

        if replayed > 0 {
            debug!(?class, replayed, applied, "Replayed delivery outcomes");
        }
        Ok((replayed, applied))
    }

    /// Finish SENDING campaigns whose active task holds no messages any more.
    ///
    /// Tasks of campaigns already FINISHED (e.g. a paused campaign expired by
    /// retention) are dropped with whatever messages they still hold.
    pub async fn finish_drained_campaigns(&self) -> Result<usize> {
        let mut finished = 0;
        for task in self.ops.list_tasks(TaskKind::Campaign).await? {
            let Some(campaign_id) = task.campaign_id else {
                continue;
            };
            let remaining = self.ops.count_task_messages(&task.id).await?;
            if task.is_active() && remaining > 0 {
                continue;
            }

            let campaign = match self.campaigns.get_campaign(campaign_id).await {
                Ok(campaign) => campaign,
                Err(Error::NotFound { .. }) => {
                    warn!(campaign_id, "Dropping task of a deleted campaign");
                    self.ops.delete_task(&task.id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match campaign.campaign_status() {
                Some(CampaignStatus::Sending) if task.is_active() && remaining == 0 => {
                    if self
                        .campaigns
                        .transition(campaign_id, CampaignStatus::Sending, CampaignStatus::Finished)
                        .await?
                    {
                        info!(
                            campaign_id,
                            delivered = campaign.delivered,
                            failed = campaign.failed,
                            "Campaign finished"
                        );
                        finished += 1;
                    }
                    self.ops.delete_task(&task.id).await?;
                }
                Some(CampaignStatus::Finished) => {
                    if remaining > 0 {
                        info!(
                            campaign_id,
                            task_status = %task.status,
                            remaining,
                            "Dropping task of a finished campaign"
                        );
                    }
                    self.ops.delete_task(&task.id).await?;
                }
                _ => {}
            }
        }
        Ok(finished)
    }

    /// Feed channel reports into the back-off tracker and mirror the
    /// resulting postponements for sender workers.
    pub async fn apply_channel_reports(&self, now: i64) -> Result<usize> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut total = 0;

        loop {
            let reports = self.ops.drain_channel_reports(chunk_size).await?;
            if reports.is_empty() {
                break;
            }
            total += reports.len();

            for report in &reports {
                let channel = report.send_configuration_id;
                match report.channel_outcome() {
                    Some(ChannelOutcome::Failure) => {
                        // Failures of one outage arrive from every worker
                        // sending on the channel; only the first one after a
                        // postponement ends escalates the back-off.
                        if let Some(status) = self.tracker.on_failure(channel, report.reported_at) {
                            self.ops
                                .set_channel_postponement(&ChannelPostponementDbModel {
                                    send_configuration_id: channel,
                                    retry_count: i64::from(status.retry_count),
                                    postpone_till: status.postpone_till,
                                    updated_at: now,
                                })
                                .await?;
                        }
                    }
                    Some(ChannelOutcome::Success) => {
                        if self.tracker.on_success(channel, report.reported_at) {
                            self.ops.clear_channel_postponement(channel).await?;
                        }
                    }
                    None => warn!(
                        channel_id = channel,
                        outcome = %report.outcome,
                        "Ignoring channel report with unknown outcome"
                    ),
                }
            }

            if (reports.len() as i64) < chunk_size {
                break;
            }
        }
        Ok(total)
    }

    /// Run passes until cancelled: on every push, and at least every poll
    /// period so outcomes keep flowing back.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(poll_ms = self.config.poll_ms, "Synchronizer started");
        if let Err(e) = self.recover(now_ms()).await {
            error!(error = %e, "Synchronizer recovery failed");
        }

        // Work requeued after a failure waits for the next push or poll.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inbox.notified() => {}
                _ = tokio::time::sleep(self.config.poll_period()) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            match self.sync_once(now_ms()).await {
                Ok(stats) if !stats.is_idle() => debug!(?stats, "Synchronizer pass complete"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Synchronizer pass failed"),
            }
        }

        info!("Synchronizer stopped");
    }
}
