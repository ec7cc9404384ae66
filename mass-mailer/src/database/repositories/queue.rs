//! Queued (transactional) message repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::{ActivityTxOps, push_not_in};
use crate::database::models::{
    ActivityLogDbModel, ENTITY_QUEUED_MESSAGE, MessageOutcome, MessageStatus, QueueType,
    QueuedMessageDbModel,
};
use crate::database::{begin_immediate, time::now_ms};
use crate::{Error, Result};

/// Queued message repository trait.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn enqueue(&self, message: &QueuedMessageDbModel) -> Result<i64>;
    async fn get_message(&self, id: i64) -> Result<QueuedMessageDbModel>;

    /// Delete messages of `queue_type` created before `cutoff_ms` that are not
    /// held by the operational store.
    async fn prune_expired(&self, queue_type: QueueType, cutoff_ms: i64) -> Result<u64>;

    /// Schedulable messages (not in progress) of channels not in `postponed_channels`.
    async fn list_schedulable(
        &self,
        postponed_channels: &[i64],
        limit: i64,
    ) -> Result<Vec<QueuedMessageDbModel>>;

    /// Mark the still-schedulable subset of `ids` as processing and lock their
    /// attachments. Returns the rows that were claimed.
    async fn claim_for_sync(&self, ids: &[i64]) -> Result<Vec<QueuedMessageDbModel>>;

    /// Undo `claim_for_sync` for messages that never reached the operational store.
    async fn release_processing(&self, ids: &[i64]) -> Result<u64>;

    /// Apply replayed outcomes in a single transaction.
    ///
    /// Sent messages are removed from the queue, failed ones keep their
    /// response. Attachments are unlocked in both cases. Messages no longer
    /// in progress are skipped, which makes the replay idempotent.
    async fn apply_outcomes(&self, outcomes: &[MessageOutcome]) -> Result<u64>;
}

/// SQLx implementation of QueueRepository.
pub struct SqlxQueueRepository {
    pool: SqlitePool,
}

impl SqlxQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Adjust the lock counter of every attachment of `message` by `delta`.
async fn adjust_attachment_locks(
    tx: &mut SqliteConnection,
    message: &QueuedMessageDbModel,
    delta: i64,
) -> Result<()> {
    for file_id in message.attachment_ids()? {
        sqlx::query("UPDATE files SET locked = MAX(locked + ?, 0) WHERE id = ?")
            .bind(delta)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn enqueue(&self, message: &QueuedMessageDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO queued_messages (
                send_configuration_id, queue_type, email, hash_email_piece, data, attachments,
                status, processing, response, response_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.send_configuration_id)
        .bind(&message.queue_type)
        .bind(&message.email)
        .bind(message.hash_email_piece)
        .bind(&message.data)
        .bind(&message.attachments)
        .bind(&message.status)
        .bind(message.processing)
        .bind(&message.response)
        .bind(&message.response_id)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_message(&self, id: i64) -> Result<QueuedMessageDbModel> {
        sqlx::query_as::<_, QueuedMessageDbModel>("SELECT * FROM queued_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("QueuedMessage", id.to_string()))
    }

    async fn prune_expired(&self, queue_type: QueueType, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queued_messages
            WHERE queue_type = ? AND created_at < ? AND processing = 0
            "#,
        )
        .bind(queue_type.as_str())
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_schedulable(
        &self,
        postponed_channels: &[i64],
        limit: i64,
    ) -> Result<Vec<QueuedMessageDbModel>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT * FROM queued_messages WHERE status = 'SCHEDULED' AND processing = 0",
        );
        push_not_in(&mut qb, "send_configuration_id", postponed_channels);
        qb.push(" ORDER BY send_configuration_id, id LIMIT ");
        qb.push_bind(limit);

        let messages = qb
            .build_query_as::<QueuedMessageDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn claim_for_sync(&self, ids: &[i64]) -> Result<Vec<QueuedMessageDbModel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = begin_immediate(&self.pool).await?;
        let now = now_ms();
        let mut claimed = Vec::with_capacity(ids.len());

        for id in ids {
            let found = sqlx::query_as::<_, QueuedMessageDbModel>(
                "SELECT * FROM queued_messages WHERE id = ? AND status = 'SCHEDULED' AND processing = 0",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(mut message) = found else {
                continue;
            };

            sqlx::query("UPDATE queued_messages SET processing = 1, updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            adjust_attachment_locks(&mut tx, &message, 1).await?;

            message.processing = 1;
            message.updated_at = now;
            claimed.push(message);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn release_processing(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = begin_immediate(&self.pool).await?;
        let now = now_ms();
        let mut released = 0u64;

        for id in ids {
            let found = sqlx::query_as::<_, QueuedMessageDbModel>(
                "SELECT * FROM queued_messages WHERE id = ? AND processing = 1",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(message) = found else {
                continue;
            };

            sqlx::query("UPDATE queued_messages SET processing = 0, updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            adjust_attachment_locks(&mut tx, &message, -1).await?;
            released += 1;
        }

        tx.commit().await?;
        Ok(released)
    }

    async fn apply_outcomes(&self, outcomes: &[MessageOutcome]) -> Result<u64> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let mut tx = begin_immediate(&self.pool).await?;
        let now = now_ms();
        let mut applied = 0u64;

        for outcome in outcomes {
            let found = sqlx::query_as::<_, QueuedMessageDbModel>(
                "SELECT * FROM queued_messages WHERE id = ? AND status = 'SCHEDULED' AND processing = 1",
            )
            .bind(outcome.source_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(message) = found else {
                continue;
            };

            match outcome.status {
                MessageStatus::Sent => {
                    sqlx::query("DELETE FROM queued_messages WHERE id = ?")
                        .bind(message.id)
                        .execute(&mut *tx)
                        .await?;
                }
                MessageStatus::Failed => {
                    sqlx::query(
                        r#"
                        UPDATE queued_messages
                        SET status = 'FAILED', processing = 0, response = ?, response_id = ?, updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&outcome.response)
                    .bind(&outcome.response_id)
                    .bind(now)
                    .bind(message.id)
                    .execute(&mut *tx)
                    .await?;
                }
                MessageStatus::Scheduled => continue,
            }

            adjust_attachment_locks(&mut tx, &message, -1).await?;

            let data = serde_json::json!({
                "queue_type": message.queue_type,
                "email": message.email,
                "response": outcome.response,
                "response_id": outcome.response_id,
            });
            let entry = ActivityLogDbModel::new(
                ENTITY_QUEUED_MESSAGE,
                message.id,
                outcome.status.as_str(),
            )
            .with_data(data.to_string());
            ActivityTxOps::record(&mut tx, &entry).await?;
            applied += 1;
        }

        tx.commit().await?;
        Ok(applied)
    }
}
