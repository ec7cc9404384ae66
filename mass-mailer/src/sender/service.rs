//! Sender loop service.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::coordinator::LivenessCoordinator;
use crate::database::time::now_ms;
use crate::mail::{MailComposer, MailTransport, SendError, TaskBundle};
use crate::operational::{
    ChannelOutcome, ChannelReportDbModel, MessageClass, OperationalStore, OutgoingMessageDbModel,
};

/// Default messages pulled per range and class (100).
pub const DEFAULT_CHUNK_SIZE: i64 = 100;

/// Default sleep after a pass without progress (1 second).
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 1_000;

/// Sender loop configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Messages pulled per owned range and message class.
    pub chunk_size: i64,
    /// Sleep after a pass that delivered nothing, in milliseconds.
    pub idle_sleep_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_sleep_ms: DEFAULT_IDLE_SLEEP_MS,
        }
    }
}

impl SenderConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationStats {
    pub pulled: usize,
    pub sent: usize,
    pub failed: usize,
    /// Reverted to SCHEDULED after a transient failure.
    pub deferred: usize,
    /// Not attempted: channel errored this iteration, task gone or paused,
    /// or another worker took the message first.
    pub skipped: usize,
    /// Store errors while fetching or delivering. A message left SENT by one
    /// is settled by the stale-SENT replay.
    pub errors: usize,
}

impl IterationStats {
    /// Messages that reached a final state.
    pub fn progressed(&self) -> usize {
        self.sent + self.failed
    }
}

/// Per-iteration state.
#[derive(Default)]
struct Iteration {
    stats: IterationStats,
    /// Channels with a transient failure; the rest of their messages wait for
    /// the next iteration.
    errored: HashSet<i64>,
    /// Channels with a postponement row, active or expired.
    recovering: HashSet<i64>,
    /// Channels a SUCCESS report was written for.
    reported_success: HashSet<i64>,
    /// Bundles of active tasks, `None` for tasks that are gone or paused.
    bundles: HashMap<String, Option<Arc<TaskBundle>>>,
}

pub struct SenderLoop {
    ops: Arc<dyn OperationalStore>,
    composer: Arc<dyn MailComposer>,
    transport: Arc<dyn MailTransport>,
    coordinator: Arc<LivenessCoordinator>,
    config: SenderConfig,
}

impl SenderLoop {
    pub fn new(
        ops: Arc<dyn OperationalStore>,
        composer: Arc<dyn MailComposer>,
        transport: Arc<dyn MailTransport>,
        coordinator: Arc<LivenessCoordinator>,
        config: SenderConfig,
    ) -> Self {
        Self {
            ops,
            composer,
            transport,
            coordinator,
            config,
        }
    }

    fn worker_id(&self) -> i64 {
        self.coordinator.worker_id()
    }

    /// One pass over every owned range: campaign messages first, then
    /// queued messages.
    ///
    /// Substitutions of synchronizing workers are released afterwards, also
    /// when the pass failed.
    pub async fn run_iteration(&self) -> Result<IterationStats> {
        let drained = self.drain_owned_ranges().await;

        if let Err(e) = self.coordinator.release_synchronizing_workers().await {
            warn!(worker_id = self.worker_id(), error = %e, "Failed to release synchronizing workers");
        }

        drained
    }

    async fn drain_owned_ranges(&self) -> Result<IterationStats> {
        let now = now_ms();
        let mut it = Iteration::default();

        // Without the postponement list postponed channels would be sent to.
        let mut postponed = Vec::new();
        for row in self.ops.list_channel_postponements().await? {
            if row.is_active(now) {
                postponed.push(row.send_configuration_id);
            }
            it.recovering.insert(row.send_configuration_id);
        }

        for range in self.coordinator.active_ranges() {
            for class in [MessageClass::Campaign, MessageClass::Queued] {
                let messages = match self
                    .ops
                    .fetch_due_messages(range, class, &postponed, self.config.chunk_size)
                    .await
                {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(
                            worker_id = self.worker_id(),
                            range = %range,
                            ?class,
                            error = %e,
                            "Failed to fetch due messages"
                        );
                        it.stats.errors += 1;
                        continue;
                    }
                };
                it.stats.pulled += messages.len();

                for message in &messages {
                    if it.errored.contains(&message.send_configuration_id) {
                        it.stats.skipped += 1;
                        continue;
                    }
                    if let Err(e) = self.deliver(message, &mut it).await {
                        warn!(
                            worker_id = self.worker_id(),
                            message_id = message.id,
                            channel_id = message.send_configuration_id,
                            error = %e,
                            "Failed to deliver message"
                        );
                        it.stats.errors += 1;
                    }
                }
            }
        }

        Ok(it.stats)
    }

    async fn bundle_for(
        &self,
        message: &OutgoingMessageDbModel,
        it: &mut Iteration,
    ) -> Result<Option<Arc<TaskBundle>>> {
        if let Some(cached) = it.bundles.get(&message.task_id) {
            return Ok(cached.clone());
        }

        let bundle = match self.ops.get_task(&message.task_id).await? {
            Some(task) if task.is_active() => match task.task_bundle() {
                Ok(bundle) => Some(Arc::new(bundle)),
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Unreadable task bundle");
                    None
                }
            },
            _ => None,
        };
        it.bundles.insert(message.task_id.clone(), bundle.clone());
        Ok(bundle)
    }

    /// Deliver one message.
    ///
    /// The message is SENT before the transport is called, so a crash in
    /// between can not lead to a second delivery by another worker.
    async fn deliver(&self, message: &OutgoingMessageDbModel, it: &mut Iteration) -> Result<()> {
        let channel = message.send_configuration_id;

        let Some(bundle) = self.bundle_for(message, it).await? else {
            it.stats.skipped += 1;
            return Ok(());
        };

        let item = match message.to_mail_item() {
            Ok(item) => item,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "Undeliverable message");
                self.ops.mark_failed(message.id, &e.to_string(), now_ms()).await?;
                it.stats.failed += 1;
                return Ok(());
            }
        };

        if !self.ops.mark_sent(message.id, now_ms()).await? {
            debug!(message_id = message.id, "Message taken by another worker");
            it.stats.skipped += 1;
            return Ok(());
        }

        let result = match self.composer.compose(&bundle, &item).await {
            Ok(mail) => {
                self.transport.throttle(&bundle.channel).await;
                self.transport.send(&mail).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(receipt) => {
                self.ops
                    .record_delivery(
                        message.id,
                        &receipt.response,
                        receipt.message_id.as_deref(),
                        now_ms(),
                    )
                    .await?;
                it.stats.sent += 1;
                if it.recovering.contains(&channel) && it.reported_success.insert(channel) {
                    self.report(channel, ChannelOutcome::Success, None).await?;
                }
            }
            Err(SendError::Permanent(reason)) => {
                debug!(message_id = message.id, channel_id = channel, %reason, "Message rejected");
                self.ops.mark_failed(message.id, &reason, now_ms()).await?;
                it.stats.failed += 1;
            }
            Err(SendError::Transient(reason)) => {
                warn!(
                    worker_id = self.worker_id(),
                    message_id = message.id,
                    channel_id = channel,
                    %reason,
                    "Transient send failure, deferring channel"
                );
                it.errored.insert(channel);
                it.stats.deferred += 1;
                let reverted = self.ops.revert_to_scheduled(message.id, now_ms()).await;
                self.report(channel, ChannelOutcome::Failure, Some(reason)).await?;
                reverted?;
            }
        }
        Ok(())
    }

    async fn report(
        &self,
        channel: i64,
        outcome: ChannelOutcome,
        reason: Option<String>,
    ) -> Result<()> {
        let report = ChannelReportDbModel::new(channel, self.worker_id(), outcome, reason, now_ms());
        self.ops.add_channel_report(&report).await?;
        Ok(())
    }

    /// Iterate until cancelled. A running iteration is always finished.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker_id = self.worker_id(), "Sender loop started");

        while !cancel.is_cancelled() {
            let idle = match self.run_iteration().await {
                Ok(stats) => {
                    if stats.pulled > 0 {
                        debug!(worker_id = self.worker_id(), ?stats, "Sender iteration complete");
                    }
                    stats.progressed() == 0
                }
                Err(e) => {
                    error!(worker_id = self.worker_id(), error = %e, "Sender iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_sleep()) => {}
                }
            }
        }

        info!(worker_id = self.worker_id(), "Sender loop stopped");
    }
}
