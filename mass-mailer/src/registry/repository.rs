//! Worker registry repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::model::{WorkerId, WorkerRecord, WorkerState};
use super::range::{HashRange, partition};
use crate::database::begin_immediate;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Result of an attempt to take over a non-working worker's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The candidate is now substituted by the claimer.
    Claimed {
        range: HashRange,
        /// Records that the candidate itself substituted and that were released.
        freed: u64,
    },
    /// Another worker claimed the candidate first, or it reported alive since it was read.
    Lost,
}

/// Worker registry trait.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Create the records of a pool of `max_workers` slots over `[0, max_range)`.
    ///
    /// Missing records are inserted as SYNCHRONIZING. Existing records must
    /// match the computed partition unless `reset` rewrites them all.
    async fn bootstrap(&self, max_workers: u32, max_range: i64, reset: bool) -> Result<()>;

    async fn get_worker(&self, id: WorkerId) -> Result<WorkerRecord>;
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;

    /// Unconditional heartbeat.
    async fn report_alive(&self, id: WorkerId, now: i64) -> Result<()>;
    async fn set_state(&self, id: WorkerId, state: WorkerState) -> Result<()>;

    /// Compare-and-swap claim of `candidate` as read by the caller.
    ///
    /// Succeeds only while the candidate's `last_report` is unchanged and it
    /// has no substitute.
    async fn try_claim(&self, candidate: &WorkerRecord, claimer: WorkerId)
    -> Result<ClaimOutcome>;

    /// Clear the substitute of every record in `ids`, all of which must
    /// currently name `claimer`. Partial matches abort the whole release with
    /// [`Error::RegistryConflict`].
    async fn release(&self, ids: &[WorkerId], claimer: WorkerId) -> Result<()>;

    /// Best-effort recovery when every worker waits on another.
    ///
    /// When no other record is WORKING with a fresh heartbeat, force every
    /// WORKING record to DEAD, clear every substitute and make `self_id`
    /// WORKING. Returns whether the reset happened.
    async fn break_deadlock(&self, self_id: WorkerId, now: i64, stale_after_ms: i64)
    -> Result<bool>;
}

/// SQLx implementation of WorkerRegistry.
pub struct SqlxWorkerRegistry {
    pool: SqlitePool,
}

impl SqlxWorkerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn bootstrap_once(&self, ranges: &[HashRange], reset: bool) -> Result<()> {
        let mut tx = begin_immediate(&self.pool).await?;

        if reset {
            let removed = sqlx::query("DELETE FROM workers")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            info!(removed, "Worker registry reset");
        }

        for (id, range) in ranges.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO workers (id, state, range_from, range_to, last_report, substitute)
                VALUES (?, 'SYNCHRONIZING', ?, ?, 0, NULL)
                "#,
            )
            .bind(id as i64)
            .bind(range.from)
            .bind(range.to)
            .execute(&mut *tx)
            .await?;
        }

        let stored = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;
        let stored_ranges: Vec<HashRange> = stored.iter().map(WorkerRecord::range).collect();
        if stored_ranges != ranges {
            tx.rollback().await?;
            return Err(Error::config(format!(
                "worker registry holds {} records that do not match a pool of {} workers; restart the pool with a registry reset",
                stored.len(),
                ranges.len()
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn try_claim_once(
        &self,
        candidate: &WorkerRecord,
        claimer: WorkerId,
    ) -> Result<ClaimOutcome> {
        let mut tx = begin_immediate(&self.pool).await?;

        let current = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE id = ? AND last_report = ? AND substitute IS NULL",
        )
        .bind(candidate.id)
        .bind(candidate.last_report)
        .fetch_optional(&mut *tx)
        .await?;

        // A claimer that is itself substituted is about to demote.
        let claimer_free: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT substitute FROM workers WHERE id = ?")
                .bind(claimer)
                .fetch_optional(&mut *tx)
                .await?;

        let (Some(current), Some((None,))) = (current, claimer_free) else {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Lost);
        };

        sqlx::query("UPDATE workers SET state = 'DEAD', substitute = ? WHERE id = ?")
            .bind(claimer)
            .bind(current.id)
            .execute(&mut *tx)
            .await?;

        let freed = sqlx::query("UPDATE workers SET substitute = NULL WHERE substitute = ?")
            .bind(current.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed {
            range: current.range(),
            freed,
        })
    }

    async fn release_once(&self, ids: &[WorkerId], claimer: WorkerId) -> Result<()> {
        let mut tx = begin_immediate(&self.pool).await?;
        let mut cleared = 0u64;

        for id in ids {
            cleared += sqlx::query("UPDATE workers SET substitute = NULL WHERE id = ? AND substitute = ?")
                .bind(id)
                .bind(claimer)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        if cleared != ids.len() as u64 {
            tx.rollback().await?;
            return Err(Error::conflict(format!(
                "released {} of {} records substituted by worker {}",
                cleared,
                ids.len(),
                claimer
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn break_deadlock_once(
        &self,
        self_id: WorkerId,
        now: i64,
        stale_after_ms: i64,
    ) -> Result<bool> {
        let mut tx = begin_immediate(&self.pool).await?;

        let (alive,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM workers
            WHERE id != ? AND state = 'WORKING' AND substitute IS NULL AND last_report > ?
            "#,
        )
        .bind(self_id)
        .bind(now - stale_after_ms)
        .fetch_one(&mut *tx)
        .await?;

        if alive > 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let demoted = sqlx::query("UPDATE workers SET state = 'DEAD' WHERE state = 'WORKING'")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let released = sqlx::query("UPDATE workers SET substitute = NULL WHERE substitute IS NOT NULL")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("UPDATE workers SET state = 'WORKING', last_report = ? WHERE id = ?")
            .bind(now)
            .bind(self_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        warn!(
            worker_id = self_id,
            demoted, released, "No live working peer found, registry reset by deadlock break"
        );
        Ok(true)
    }
}

#[async_trait]
impl WorkerRegistry for SqlxWorkerRegistry {
    async fn bootstrap(&self, max_workers: u32, max_range: i64, reset: bool) -> Result<()> {
        let ranges = partition(max_workers, max_range)?;
        retry_on_sqlite_busy("bootstrap_registry", || self.bootstrap_once(&ranges, reset)).await
    }

    async fn get_worker(&self, id: WorkerId) -> Result<WorkerRecord> {
        sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Worker", id.to_string()))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let workers = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(workers)
    }

    async fn report_alive(&self, id: WorkerId, now: i64) -> Result<()> {
        let result = retry_on_sqlite_busy("report_alive", || async {
            Ok(sqlx::query("UPDATE workers SET last_report = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Worker", id.to_string()));
        }
        Ok(())
    }

    async fn set_state(&self, id: WorkerId, state: WorkerState) -> Result<()> {
        let result = retry_on_sqlite_busy("set_worker_state", || async {
            Ok(sqlx::query("UPDATE workers SET state = ? WHERE id = ?")
                .bind(state.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Worker", id.to_string()));
        }
        debug!(worker_id = id, state = %state, "Worker state updated");
        Ok(())
    }

    async fn try_claim(
        &self,
        candidate: &WorkerRecord,
        claimer: WorkerId,
    ) -> Result<ClaimOutcome> {
        if candidate.id == claimer {
            return Err(Error::validation(format!(
                "worker {} cannot substitute itself",
                claimer
            )));
        }
        retry_on_sqlite_busy("claim_worker", || self.try_claim_once(candidate, claimer)).await
    }

    async fn release(&self, ids: &[WorkerId], claimer: WorkerId) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        retry_on_sqlite_busy("release_workers", || self.release_once(ids, claimer)).await
    }

    async fn break_deadlock(
        &self,
        self_id: WorkerId,
        now: i64,
        stale_after_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("break_deadlock", || {
            self.break_deadlock_once(self_id, now, stale_after_ms)
        })
        .await
    }
}
