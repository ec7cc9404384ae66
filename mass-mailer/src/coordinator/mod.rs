//! Liveness and substitution coordinator.
//!
//! Runs inside every sender worker process. Each period the coordinator
//! reports its own heartbeat to the partition registry; every
//! `synchronizing_round` periods it looks for non-working peers and claims a
//! fair share of their ranges, and after every tick it gives back
//! substitutions beyond that share. The resulting [`OwnedRangeSet`] is what the
//! sender loop drains.

pub mod balance;
pub mod owned;
pub mod service;

pub use balance::compute_balance_factor;
pub use owned::{OwnedRangeSet, SharedRangeSet};
pub use service::{CoordinatorConfig, LivenessCoordinator, TickOutcome};
