//! Operational store.
//!
//! The store every sender worker reads its work from: send tasks pushed by
//! the synchronizer, their outgoing messages, and the per-channel reports and
//! postponements that connect sender workers with the scheduler's back-off.

pub mod models;
pub mod store;

pub use models::*;
pub use store::{OperationalStore, PushResult, SqlxOperationalStore};
