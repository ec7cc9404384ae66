//! Worker registry records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::range::HashRange;

/// Worker slot identifier, `0..max_workers`.
pub type WorkerId = i64;

/// Durable registry record of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// State: SYNCHRONIZING, WORKING, DEAD
    pub state: String,
    pub range_from: i64,
    pub range_to: i64,
    /// Unix epoch milliseconds of the last heartbeat
    pub last_report: i64,
    /// Worker currently draining this slot's range on its behalf
    pub substitute: Option<WorkerId>,
}

impl WorkerRecord {
    pub fn range(&self) -> HashRange {
        HashRange::new(self.range_from, self.range_to)
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        WorkerState::parse(&self.state)
    }

    /// Whether the heartbeat is older than `stale_after_ms` at `now`.
    pub fn is_stale(&self, now: i64, stale_after_ms: i64) -> bool {
        now - self.last_report >= stale_after_ms
    }

    /// A worker is non-working when it is substituted or its heartbeat is stale.
    pub fn is_non_working(&self, now: i64, stale_after_ms: i64) -> bool {
        self.substitute.is_some() || self.is_stale(now, stale_after_ms)
    }
}

/// Worker state values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Starting up, waiting for its range to be released by a substitute.
    Synchronizing,
    /// Draining its own range (and any substituted ranges).
    Working,
    /// Presumed dead; its range is drained by the substitute.
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronizing => "SYNCHRONIZING",
            Self::Working => "WORKING",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYNCHRONIZING" => Some(Self::Synchronizing),
            "WORKING" => Some(Self::Working),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(last_report: i64, substitute: Option<WorkerId>) -> WorkerRecord {
        WorkerRecord {
            id: 1,
            state: "WORKING".to_string(),
            range_from: 0,
            range_to: 10,
            last_report,
            substitute,
        }
    }

    #[test]
    fn test_non_working_definition() {
        // Fresh and unsubstituted.
        assert!(!record(1_000, None).is_non_working(1_500, 1_000));
        // Stale exactly at the threshold.
        assert!(record(1_000, None).is_non_working(2_000, 1_000));
        // Substituted even when fresh.
        assert!(record(1_000, Some(2)).is_non_working(1_000, 1_000));
    }

    #[test]
    fn test_worker_state_parse() {
        assert_eq!(WorkerState::parse("DEAD"), Some(WorkerState::Dead));
        assert_eq!(record(0, None).worker_state(), Some(WorkerState::Working));
        assert_eq!(WorkerState::parse("dead"), None);
    }
}
