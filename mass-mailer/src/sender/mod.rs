//! Sender loop.
//!
//! Runs inside every sender worker: pulls due messages of the ranges the
//! worker currently owns from the operational store and delivers them
//! through the mail collaborators.

mod service;

pub use service::{IterationStats, SenderConfig, SenderLoop};
