//! Work handed from the scheduler to the synchronizer.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Pending synchronizer work, drained as one batch per pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncWork {
    /// Campaigns moved to SYNCHRONIZING.
    pub campaigns: BTreeSet<i64>,
    /// Campaigns in PAUSING.
    pub pausing: BTreeSet<i64>,
    /// Queued message ids grouped by channel.
    pub queued: BTreeMap<i64, BTreeSet<i64>>,
}

impl SyncWork {
    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty() && self.pausing.is_empty() && self.queued.is_empty()
    }

    /// Put work that could not be processed back for the next pass.
    pub fn merge(&mut self, other: SyncWork) {
        self.campaigns.extend(other.campaigns);
        self.pausing.extend(other.pausing);
        for (channel, ids) in other.queued {
            self.queued.entry(channel).or_default().extend(ids);
        }
    }
}

/// Mailbox between the scheduler and the synchronizer.
///
/// Pushing work marks the inbox available and wakes the synchronizer. Duplicate
/// pushes collapse.
#[derive(Debug, Default)]
pub struct SyncInbox {
    pending: Mutex<SyncWork>,
    notify: Notify,
}

impl SyncInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_campaign(&self, campaign_id: i64) {
        self.pending.lock().campaigns.insert(campaign_id);
        self.notify.notify_one();
    }

    pub fn push_pause(&self, campaign_id: i64) {
        self.pending.lock().pausing.insert(campaign_id);
        self.notify.notify_one();
    }

    pub fn push_queued(&self, send_configuration_id: i64, message_ids: impl IntoIterator<Item = i64>) {
        {
            let mut pending = self.pending.lock();
            let entry = pending.queued.entry(send_configuration_id).or_default();
            entry.extend(message_ids);
            if entry.is_empty() {
                pending.queued.remove(&send_configuration_id);
                return;
            }
        }
        self.notify.notify_one();
    }

    /// Return unprocessed work without waking the synchronizer.
    pub fn requeue(&self, work: SyncWork) {
        if !work.is_empty() {
            self.pending.lock().merge(work);
        }
    }

    pub fn task_available(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Wait for the next push.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Take everything pending.
    pub fn take(&self) -> SyncWork {
        std::mem::take(&mut *self.pending.lock())
    }
}
