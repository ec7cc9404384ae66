//! Hash ranges and the base partition of the recipient hash space.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{Error, Result};

/// Size of the hash space: `hash_email_piece` yields 32-bit values.
pub const DEFAULT_MAX_RANGE: i64 = 1 << 32;

/// Half-open range `[from, to)` of hash pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashRange {
    pub from: i64,
    pub to: i64,
}

impl HashRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, piece: i64) -> bool {
        piece >= self.from && piece < self.to
    }

    pub fn len(&self) -> i64 {
        (self.to - self.from).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Split `[0, max_range)` into `max_workers` contiguous ranges ordered by
/// worker id. The last range absorbs the remainder.
pub fn partition(max_workers: u32, max_range: i64) -> Result<Vec<HashRange>> {
    if max_workers == 0 {
        return Err(Error::config("max_workers must be at least 1"));
    }
    if max_range < i64::from(max_workers) {
        return Err(Error::config(format!(
            "max_range {} is smaller than max_workers {}",
            max_range, max_workers
        )));
    }

    let workers = i64::from(max_workers);
    let size = max_range / workers;
    let ranges = (0..workers)
        .map(|i| {
            let from = i * size;
            let to = if i == workers - 1 { max_range } else { from + size };
            HashRange::new(from, to)
        })
        .collect();
    Ok(ranges)
}

/// The base range of a single worker slot.
pub fn range_for_worker(worker_id: i64, max_workers: u32, max_range: i64) -> Result<HashRange> {
    let ranges = partition(max_workers, max_range)?;
    usize::try_from(worker_id)
        .ok()
        .and_then(|idx| ranges.get(idx).copied())
        .ok_or_else(|| {
            Error::config(format!(
                "worker id {} is outside the pool of {} workers",
                worker_id, max_workers
            ))
        })
}

/// Derive the 32-bit hash piece that places a recipient into exactly one range.
///
/// First four bytes (big endian) of SHA-256 over the trimmed, lower-cased address.
pub fn hash_email_piece(email: &str) -> i64 {
    let normalized = email.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let piece = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    i64::from(piece)
}
