//! mass-mailer library crate.
//!
//! Core of a distributed mass-mail delivery system: a pool of sender workers
//! sharing a partitioned recipient hash space, a singleton scheduler with
//! per-channel retry back-off, and a synchronizer bridging the relational and
//! operational stores.

pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod logging;
pub mod mail;
pub mod operational;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod shutdown;
pub mod synchronizer;

pub use error::{Error, Result};
