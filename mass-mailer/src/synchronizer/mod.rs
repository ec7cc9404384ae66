//! Synchronizer.
//!
//! Single-threaded bridge between the relational store and the operational
//! store. It pushes work claimed by the scheduler, replays delivery outcomes
//! back into the relational store and feeds channel reports into the retry
//! back-off.

mod inbox;
mod service;

pub use inbox::{SyncInbox, SyncWork};
pub use service::{SyncStats, Synchronizer, SynchronizerConfig};
