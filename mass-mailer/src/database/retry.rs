//! Retry helpers for contended store writes.
//!
//! Every sender worker writes to the same operational store, so registry claims
//! and outcome updates can hit `SQLITE_BUSY`/`SQLITE_LOCKED` even with a busy
//! timeout configured. These helpers retry such failures with capped
//! exponential back-off and jitter.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: usize = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

/// Whether an error is SQLite reporting a locked or busy database.
pub fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        return busy_message(&sqlx_err.to_string());
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    busy_message(db_err.message())
}

fn busy_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked")
        || msg.contains("database is busy")
        || msg.contains("database table is locked")
}

/// Delay before retry number `attempt` (zero based), without jitter.
fn backoff_delay_ms(attempt: usize) -> u64 {
    let shift = attempt.min(16) as u32;
    BUSY_BASE_DELAY_MS
        .saturating_mul(1u64 << shift)
        .min(BUSY_MAX_DELAY_MS)
}

/// Run `op`, retrying while it fails with a busy/locked error.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let capped_ms = backoff_delay_ms(attempt);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay = Duration::from_millis((capped_ms + jitter_ms).min(BUSY_MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
