//! Partition registry.
//!
//! One durable [`WorkerRecord`] per worker slot describes which slice of the
//! recipient hash space the slot owns and whether another worker currently
//! substitutes for it. The registry is the only resource every sender worker
//! writes to; all of its mutations are transactions guarded by an "unchanged
//! since read" precondition.

pub mod model;
pub mod range;
pub mod repository;

pub use model::{WorkerId, WorkerRecord, WorkerState};
pub use range::{DEFAULT_MAX_RANGE, HashRange, hash_email_piece, partition, range_for_worker};
pub use repository::{ClaimOutcome, SqlxWorkerRegistry, WorkerRegistry};
