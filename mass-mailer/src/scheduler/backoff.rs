//! Per-channel retry back-off.
//!
//! Every transient failure reported for a channel pushes its postponement
//! further along [`BACKOFF_SECS`]. While postponed, the channel's campaigns
//! and queued messages are left out of scheduling and sender workers skip
//! its messages. A success reported after the postponement ended clears the
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::database::time::duration_ms;

/// Back-off steps in seconds. Failures past the last step reuse it.
pub const BACKOFF_SECS: [u64; 9] = [100, 150, 200, 300, 600, 600, 1200, 1200, 3000];

/// Postponement after the `retry_count`-th consecutive failure.
pub fn backoff_delay(retry_count: u32) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let index = (retry_count as usize - 1).min(BACKOFF_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SECS[index])
}

/// Back-off state of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub retry_count: u32,
    /// Unix epoch milliseconds
    pub postpone_till: i64,
}

impl ChannelStatus {
    pub fn is_postponed(&self, now: i64) -> bool {
        self.postpone_till > now
    }
}

/// Back-off state of every failing channel.
#[derive(Debug, Default)]
pub struct ChannelStatusTracker {
    statuses: Mutex<HashMap<i64, ChannelStatus>>,
    wake: Arc<Notify>,
}

impl ChannelStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notified when a postponement expires.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Record a failure reported at `reported_at`.
    ///
    /// A failure reported while the channel is still postponed belongs to the
    /// outage already accounted for and is ignored (`None`).
    pub fn on_failure(&self, channel: i64, reported_at: i64) -> Option<ChannelStatus> {
        let status = {
            let mut statuses = self.statuses.lock();
            let status = statuses.entry(channel).or_default();
            if status.is_postponed(reported_at) {
                return None;
            }
            status.retry_count = status.retry_count.saturating_add(1);
            let delay = backoff_delay(status.retry_count);
            status.postpone_till = reported_at.saturating_add(duration_ms(delay));
            *status
        };

        info!(
            channel_id = channel,
            retry_count = status.retry_count,
            postpone_till = status.postpone_till,
            "Channel postponed"
        );
        self.schedule_wake(backoff_delay(status.retry_count));
        Some(status)
    }

    /// Record a success reported at `reported_at`.
    ///
    /// Returns `true` when the channel has no back-off state afterwards.
    pub fn on_success(&self, channel: i64, reported_at: i64) -> bool {
        let mut statuses = self.statuses.lock();
        let Some(status) = statuses.get(&channel) else {
            return true;
        };
        if reported_at < status.postpone_till {
            return false;
        }
        statuses.remove(&channel);
        debug!(channel_id = channel, "Channel recovered, back-off cleared");
        true
    }

    pub fn status(&self, channel: i64) -> Option<ChannelStatus> {
        self.statuses.lock().get(&channel).copied()
    }

    pub fn is_postponed(&self, channel: i64, now: i64) -> bool {
        self.status(channel).is_some_and(|s| s.is_postponed(now))
    }

    /// Channels postponed at `now`, sorted.
    pub fn postponed_channels(&self, now: i64) -> Vec<i64> {
        let mut channels: Vec<i64> = self
            .statuses
            .lock()
            .iter()
            .filter(|(_, status)| status.is_postponed(now))
            .map(|(channel, _)| *channel)
            .collect();
        channels.sort_unstable();
        channels
    }

    /// Every channel with back-off state.
    pub fn snapshot(&self) -> Vec<(i64, ChannelStatus)> {
        let mut all: Vec<(i64, ChannelStatus)> = self
            .statuses
            .lock()
            .iter()
            .map(|(channel, status)| (*channel, *status))
            .collect();
        all.sort_unstable_by_key(|(channel, _)| *channel);
        all
    }

    /// Restore state persisted by a previous process.
    pub fn restore(&self, channel: i64, status: ChannelStatus, now: i64) {
        self.statuses.lock().insert(channel, status);
        if status.is_postponed(now) {
            self.schedule_wake(Duration::from_millis((status.postpone_till - now) as u64));
        }
    }

    fn schedule_wake(&self, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let wake = self.wake.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table_is_clamped() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(100));
        assert_eq!(backoff_delay(9), Duration::from_secs(3000));
        assert_eq!(backoff_delay(50), Duration::from_secs(3000));
    }

    #[test]
    fn test_ten_consecutive_failures() {
        let tracker = ChannelStatusTracker::new();
        let mut now = 0i64;
        let mut delays = Vec::new();
        for _ in 0..10 {
            let status = tracker.on_failure(1, now).unwrap();
            delays.push((status.postpone_till - now) / 1000);
            now = status.postpone_till;
        }
        assert_eq!(
            delays,
            vec![100, 150, 200, 300, 600, 600, 1200, 1200, 3000, 3000]
        );
    }

    #[test]
    fn test_failure_during_postponement_is_ignored() {
        let tracker = ChannelStatusTracker::new();
        tracker.on_failure(1, 0).unwrap();
        assert!(tracker.on_failure(1, 50_000).is_none());
        assert_eq!(tracker.status(1).unwrap().retry_count, 1);
        assert!(tracker.is_postponed(1, 99_999));
        assert!(!tracker.is_postponed(1, 100_000));
        assert_eq!(tracker.postponed_channels(0), vec![1]);
    }

    #[test]
    fn test_success_clears_only_after_postponement() {
        let tracker = ChannelStatusTracker::new();
        assert!(tracker.on_success(1, 0));

        tracker.on_failure(1, 0).unwrap();
        tracker.on_failure(1, 100_000).unwrap();
        assert!(!tracker.on_success(1, 200_000));
        assert_eq!(tracker.status(1).unwrap().retry_count, 2);

        assert!(tracker.on_success(1, 250_000));
        assert!(tracker.status(1).is_none());
        // Next failure starts from the first step again.
        let status = tracker.on_failure(1, 300_000).unwrap();
        assert_eq!(status.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_wakes_scheduler() {
        let tracker = ChannelStatusTracker::new();
        let wake = tracker.wake_handle();
        tracker.on_failure(3, 0).unwrap();
        tokio::time::timeout(Duration::from_secs(101), wake.notified())
            .await
            .unwrap();
    }
}
