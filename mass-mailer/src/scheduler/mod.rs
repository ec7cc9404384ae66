//! Scheduler.
//!
//! Singleton loop that decides what becomes sendable: it finishes expired
//! campaigns, claims due ones, prunes and batches queued messages, and keeps
//! the per-channel retry back-off that keeps failing channels out of both
//! selections.

mod backoff;
mod service;

pub use backoff::{BACKOFF_SECS, ChannelStatus, ChannelStatusTracker, backoff_delay};
pub use service::{CampaignCheckStats, QueueCheckStats, QueueRetention, Scheduler, SchedulerConfig};
