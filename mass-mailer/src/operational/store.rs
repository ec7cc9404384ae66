//! Operational store repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::models::{
    ChannelPostponementDbModel, ChannelReportDbModel, MessageClass, OutgoingMessageDbModel,
    SendTaskDbModel, TaskKind, TaskStatus,
};
use crate::Result;
use crate::database::begin_immediate;
use crate::database::repositories::push_not_in;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::registry::HashRange;

/// Result of pushing a task with its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushResult {
    /// Messages inserted by this push.
    pub inserted: u64,
    /// Messages of the task still waiting for delivery after the push.
    pub pending: u64,
}

fn class_filter(class: MessageClass) -> &'static str {
    match class {
        MessageClass::Campaign => "m.kind = 'CAMPAIGN'",
        MessageClass::Queued => "m.kind <> 'CAMPAIGN'",
    }
}

/// Operational store trait.
#[async_trait]
pub trait OperationalStore: Send + Sync {
    // Tasks

    /// Upsert `task` as ACTIVE and insert the messages it does not hold yet,
    /// in one transaction.
    async fn push_task(
        &self,
        task: &SendTaskDbModel,
        messages: &[OutgoingMessageDbModel],
    ) -> Result<PushResult>;
    async fn get_task(&self, task_id: &str) -> Result<Option<SendTaskDbModel>>;
    async fn list_tasks(&self, kind: TaskKind) -> Result<Vec<SendTaskDbModel>>;
    async fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool>;
    async fn count_task_messages(&self, task_id: &str) -> Result<u64>;
    /// Delete a task and every message it still holds.
    async fn delete_task(&self, task_id: &str) -> Result<()>;

    // Delivery

    /// Due messages of `class` inside `range` that belong to an active task
    /// and a channel outside `excluded_channels`, in priority order.
    async fn fetch_due_messages(
        &self,
        range: HashRange,
        class: MessageClass,
        excluded_channels: &[i64],
        limit: i64,
    ) -> Result<Vec<OutgoingMessageDbModel>>;
    /// SCHEDULED to SENT. Returns false when another worker got there first.
    async fn mark_sent(&self, id: i64, now: i64) -> Result<bool>;
    /// Store the transport response of a SENT message.
    async fn record_delivery(
        &self,
        id: i64,
        response: &str,
        response_id: Option<&str>,
        now: i64,
    ) -> Result<bool>;
    /// SENT back to SCHEDULED after a transient failure.
    async fn revert_to_scheduled(&self, id: i64, now: i64) -> Result<bool>;
    async fn mark_failed(&self, id: i64, response: &str, now: i64) -> Result<bool>;

    // Replay

    /// Settled messages of `class`: FAILED, SENT with a response, or SENT
    /// without one but last touched before `stale_before`.
    async fn fetch_completed(
        &self,
        class: MessageClass,
        stale_before: i64,
        limit: i64,
    ) -> Result<Vec<OutgoingMessageDbModel>>;
    async fn delete_messages(&self, ids: &[i64]) -> Result<u64>;

    // Channel state

    async fn add_channel_report(&self, report: &ChannelReportDbModel) -> Result<i64>;
    /// Remove and return the oldest `limit` channel reports.
    async fn drain_channel_reports(&self, limit: i64) -> Result<Vec<ChannelReportDbModel>>;
    async fn list_channel_postponements(&self) -> Result<Vec<ChannelPostponementDbModel>>;
    async fn set_channel_postponement(&self, postponement: &ChannelPostponementDbModel)
    -> Result<()>;
    async fn clear_channel_postponement(&self, send_configuration_id: i64) -> Result<bool>;
}

/// SQLx implementation of OperationalStore.
pub struct SqlxOperationalStore {
    pool: SqlitePool,
}

impl SqlxOperationalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn push_task_once(
        &self,
        task: &SendTaskDbModel,
        messages: &[OutgoingMessageDbModel],
    ) -> Result<PushResult> {
        let mut tx = begin_immediate(&self.pool).await?;

        sqlx::query(
            r#"
            INSERT INTO send_tasks (
                id, kind, campaign_id, send_configuration_id, status, bundle, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'ACTIVE', ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = 'ACTIVE',
                bundle = excluded.bundle,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.kind)
        .bind(task.campaign_id)
        .bind(task.send_configuration_id)
        .bind(&task.bundle)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        let mut inserted = 0u64;
        for message in messages {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO outgoing_messages (
                    task_id, kind, source_id, campaign_id, list_id, subscription_id,
                    send_configuration_id, priority, recipient, hash_email_piece, data,
                    attachments, status, response, response_id, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'SCHEDULED', NULL, NULL, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&message.kind)
            .bind(message.source_id)
            .bind(message.campaign_id)
            .bind(message.list_id)
            .bind(message.subscription_id)
            .bind(message.send_configuration_id)
            .bind(message.priority)
            .bind(&message.recipient)
            .bind(message.hash_email_piece)
            .bind(&message.data)
            .bind(&message.attachments)
            .bind(message.created_at)
            .bind(message.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outgoing_messages WHERE task_id = ? AND status = 'SCHEDULED'",
        )
        .bind(&task.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PushResult {
            inserted,
            pending: pending.max(0) as u64,
        })
    }

    async fn delete_task_once(&self, task_id: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.pool).await?;
        sqlx::query("DELETE FROM outgoing_messages WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM send_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn drain_channel_reports_once(&self, limit: i64) -> Result<Vec<ChannelReportDbModel>> {
        let mut tx = begin_immediate(&self.pool).await?;

        let reports = sqlx::query_as::<_, ChannelReportDbModel>(
            "SELECT * FROM channel_reports ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if let Some(last) = reports.last() {
            sqlx::query("DELETE FROM channel_reports WHERE id <= ?")
                .bind(last.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(reports)
    }

    async fn update_status(
        &self,
        op_name: &'static str,
        sql: &'static str,
        id: i64,
        now: i64,
    ) -> Result<bool> {
        let result = retry_on_sqlite_busy(op_name, || async {
            Ok(sqlx::query(sql)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OperationalStore for SqlxOperationalStore {
    async fn push_task(
        &self,
        task: &SendTaskDbModel,
        messages: &[OutgoingMessageDbModel],
    ) -> Result<PushResult> {
        let result =
            retry_on_sqlite_busy("push_task", || self.push_task_once(task, messages)).await?;
        debug!(
            task_id = %task.id,
            inserted = result.inserted,
            pending = result.pending,
            "Pushed send task"
        );
        Ok(result)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<SendTaskDbModel>> {
        let task = sqlx::query_as::<_, SendTaskDbModel>("SELECT * FROM send_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    async fn list_tasks(&self, kind: TaskKind) -> Result<Vec<SendTaskDbModel>> {
        let tasks = sqlx::query_as::<_, SendTaskDbModel>(
            "SELECT * FROM send_tasks WHERE kind = ? ORDER BY id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool> {
        let now = now_ms();
        let result = retry_on_sqlite_busy("set_task_status", || async {
            Ok(
                sqlx::query("UPDATE send_tasks SET status = ?, updated_at = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(now)
                    .bind(task_id)
                    .execute(&self.pool)
                    .await?,
            )
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_task_messages(&self, task_id: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outgoing_messages WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_task(&self, task_id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_task", || self.delete_task_once(task_id)).await
    }

    async fn fetch_due_messages(
        &self,
        range: HashRange,
        class: MessageClass,
        excluded_channels: &[i64],
        limit: i64,
    ) -> Result<Vec<OutgoingMessageDbModel>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            r#"
            SELECT m.* FROM outgoing_messages m
            JOIN send_tasks t ON t.id = m.task_id
            WHERE m.status = 'SCHEDULED' AND t.status = 'ACTIVE'
              AND m.hash_email_piece >= "#,
        );
        qb.push_bind(range.from);
        qb.push(" AND m.hash_email_piece < ");
        qb.push_bind(range.to);
        qb.push(" AND ");
        qb.push(class_filter(class));
        push_not_in(&mut qb, "m.send_configuration_id", excluded_channels);
        qb.push(" ORDER BY m.priority, m.id LIMIT ");
        qb.push_bind(limit);

        let messages = qb
            .build_query_as::<OutgoingMessageDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn mark_sent(&self, id: i64, now: i64) -> Result<bool> {
        self.update_status(
            "mark_sent",
            "UPDATE outgoing_messages SET status = 'SENT', updated_at = ? WHERE id = ? AND status = 'SCHEDULED'",
            id,
            now,
        )
        .await
    }

    async fn record_delivery(
        &self,
        id: i64,
        response: &str,
        response_id: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let result = retry_on_sqlite_busy("record_delivery", || async {
            Ok(sqlx::query(
                r#"
                UPDATE outgoing_messages
                SET response = ?, response_id = ?, updated_at = ?
                WHERE id = ? AND status = 'SENT'
                "#,
            )
            .bind(response)
            .bind(response_id)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revert_to_scheduled(&self, id: i64, now: i64) -> Result<bool> {
        self.update_status(
            "revert_to_scheduled",
            "UPDATE outgoing_messages SET status = 'SCHEDULED', response = NULL, response_id = NULL, updated_at = ? WHERE id = ? AND status = 'SENT'",
            id,
            now,
        )
        .await
    }

    async fn mark_failed(&self, id: i64, response: &str, now: i64) -> Result<bool> {
        let result = retry_on_sqlite_busy("mark_failed", || async {
            Ok(sqlx::query(
                r#"
                UPDATE outgoing_messages
                SET status = 'FAILED', response = ?, updated_at = ?
                WHERE id = ? AND status IN ('SCHEDULED', 'SENT')
                "#,
            )
            .bind(response)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_completed(
        &self,
        class: MessageClass,
        stale_before: i64,
        limit: i64,
    ) -> Result<Vec<OutgoingMessageDbModel>> {
        let sql = format!(
            r#"
            SELECT m.* FROM outgoing_messages m
            WHERE {}
              AND (
                m.status = 'FAILED'
                OR (m.status = 'SENT' AND (m.response IS NOT NULL OR m.updated_at < ?))
              )
            ORDER BY m.id
            LIMIT ?
            "#,
            class_filter(class)
        );
        let messages = sqlx::query_as::<_, OutgoingMessageDbModel>(&sql)
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    async fn delete_messages(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        retry_on_sqlite_busy("delete_messages", || async {
            let mut qb: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("DELETE FROM outgoing_messages WHERE id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            Ok(qb.build().execute(&self.pool).await?.rows_affected())
        })
        .await
    }

    async fn add_channel_report(&self, report: &ChannelReportDbModel) -> Result<i64> {
        let result = retry_on_sqlite_busy("add_channel_report", || async {
            Ok(sqlx::query(
                r#"
                INSERT INTO channel_reports (send_configuration_id, worker_id, outcome, reason, reported_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(report.send_configuration_id)
            .bind(report.worker_id)
            .bind(&report.outcome)
            .bind(&report.reason)
            .bind(report.reported_at)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn drain_channel_reports(&self, limit: i64) -> Result<Vec<ChannelReportDbModel>> {
        retry_on_sqlite_busy("drain_channel_reports", || {
            self.drain_channel_reports_once(limit)
        })
        .await
    }

    async fn list_channel_postponements(&self) -> Result<Vec<ChannelPostponementDbModel>> {
        let rows = sqlx::query_as::<_, ChannelPostponementDbModel>(
            "SELECT * FROM channel_postponements ORDER BY send_configuration_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_channel_postponement(
        &self,
        postponement: &ChannelPostponementDbModel,
    ) -> Result<()> {
        retry_on_sqlite_busy("set_channel_postponement", || async {
            sqlx::query(
                r#"
                INSERT INTO channel_postponements (send_configuration_id, retry_count, postpone_till, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(send_configuration_id) DO UPDATE SET
                    retry_count = excluded.retry_count,
                    postpone_till = excluded.postpone_till,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(postponement.send_configuration_id)
            .bind(postponement.retry_count)
            .bind(postponement.postpone_till)
            .bind(postponement.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn clear_channel_postponement(&self, send_configuration_id: i64) -> Result<bool> {
        let result = retry_on_sqlite_busy("clear_channel_postponement", || async {
            Ok(
                sqlx::query("DELETE FROM channel_postponements WHERE send_configuration_id = ?")
                    .bind(send_configuration_id)
                    .execute(&self.pool)
                    .await?,
            )
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{CampaignMessageDbModel, MessageStatus};
    use crate::database::{init_pool, run_operational_migrations};
    use crate::mail::{ChannelSettings, MailTemplate, TaskBundle};
    use crate::operational::ChannelOutcome;

    async fn setup() -> SqlxOperationalStore {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_operational_migrations(&pool).await.unwrap();
        SqlxOperationalStore::new(pool)
    }

    fn bundle(channel: i64) -> TaskBundle {
        TaskBundle {
            channel: ChannelSettings {
                id: channel,
                name: "main".to_string(),
                from_email: "news@example.com".to_string(),
                from_name: None,
                reply_to: None,
                max_per_second: None,
                settings: serde_json::json!({}),
            },
            campaign_id: Some(1),
            campaign_name: Some("Launch".to_string()),
            lists: vec![1],
            template: MailTemplate::default(),
            attachments: Vec::new(),
        }
    }

    fn campaign_messages(task: &SendTaskDbModel, pieces: &[i64]) -> Vec<OutgoingMessageDbModel> {
        pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| {
                let source = CampaignMessageDbModel {
                    id: i as i64 + 1,
                    campaign_id: 1,
                    list_id: Some(1),
                    subscription_id: Some(i as i64 + 1),
                    email: format!("r{}@example.com", i),
                    hash_email_piece: *piece,
                    status: MessageStatus::Scheduled.as_str().to_string(),
                    response: None,
                    response_id: None,
                    updated_at: 0,
                };
                OutgoingMessageDbModel::from_campaign_message(task, &source)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_push_task_is_idempotent() {
        let store = setup().await;
        let task = SendTaskDbModel::for_campaign(1, &bundle(1)).unwrap();
        let messages = campaign_messages(&task, &[10, 20, 30]);

        let first = store.push_task(&task, &messages).await.unwrap();
        assert_eq!(first, PushResult { inserted: 3, pending: 3 });
        let second = store.push_task(&task, &messages).await.unwrap();
        assert_eq!(second, PushResult { inserted: 0, pending: 3 });
        assert_eq!(store.count_task_messages(&task.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fetch_due_respects_range_channel_and_task_status() {
        let store = setup().await;
        let task = SendTaskDbModel::for_campaign(1, &bundle(1)).unwrap();
        store
            .push_task(&task, &campaign_messages(&task, &[10, 20, 300]))
            .await
            .unwrap();

        let range = HashRange::new(0, 100);
        let due = store
            .fetch_due_messages(range, MessageClass::Campaign, &[], 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|m| range.contains(m.hash_email_piece)));
        assert!(
            store
                .fetch_due_messages(range, MessageClass::Queued, &[], 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            store
                .fetch_due_messages(range, MessageClass::Campaign, &[1], 10)
                .await
                .unwrap()
                .is_empty()
        );

        store.set_task_status(&task.id, TaskStatus::Paused).await.unwrap();
        assert!(
            store
                .fetch_due_messages(range, MessageClass::Campaign, &[], 10)
                .await
                .unwrap()
                .is_empty()
        );

        // Re-pushing a paused task reactivates it.
        store.push_task(&task, &[]).await.unwrap();
        assert_eq!(
            store
                .fetch_due_messages(range, MessageClass::Campaign, &[], 10)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_mark_sent_is_exclusive_and_completion_rules() {
        let store = setup().await;
        let task = SendTaskDbModel::for_campaign(1, &bundle(1)).unwrap();
        store
            .push_task(&task, &campaign_messages(&task, &[1, 2, 3]))
            .await
            .unwrap();
        let due = store
            .fetch_due_messages(HashRange::new(0, 10), MessageClass::Campaign, &[], 10)
            .await
            .unwrap();
        let (a, b, c) = (due[0].id, due[1].id, due[2].id);

        assert!(store.mark_sent(a, 100).await.unwrap());
        assert!(!store.mark_sent(a, 100).await.unwrap());
        assert!(store.record_delivery(a, "250 OK", Some("id-1"), 110).await.unwrap());

        assert!(store.mark_sent(b, 100).await.unwrap());
        assert!(store.mark_failed(c, "550 unknown user", 100).await.unwrap());

        // b has no response yet and is not stale.
        let done = store
            .fetch_completed(MessageClass::Campaign, 50, 10)
            .await
            .unwrap();
        let ids: Vec<i64> = done.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, c]);

        let done = store
            .fetch_completed(MessageClass::Campaign, 1_000, 10)
            .await
            .unwrap();
        assert_eq!(done.len(), 3);

        assert!(store.revert_to_scheduled(b, 120).await.unwrap());
        assert_eq!(store.delete_messages(&[a, c]).await.unwrap(), 2);
        assert_eq!(store.count_task_messages(&task.id).await.unwrap(), 1);

        store.delete_task(&task.id).await.unwrap();
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert_eq!(store.count_task_messages(&task.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channel_reports_are_drained_in_order() {
        let store = setup().await;
        for at in [10, 20, 30] {
            let report = ChannelReportDbModel::new(4, 0, ChannelOutcome::Failure, None, at);
            store.add_channel_report(&report).await.unwrap();
        }

        let first = store.drain_channel_reports(2).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.reported_at).collect::<Vec<_>>(),
            vec![10, 20]
        );
        let rest = store.drain_channel_reports(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.drain_channel_reports(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channel_postponement_upsert() {
        let store = setup().await;
        let mut p = ChannelPostponementDbModel {
            send_configuration_id: 2,
            retry_count: 1,
            postpone_till: 1_000,
            updated_at: 0,
        };
        store.set_channel_postponement(&p).await.unwrap();
        p.retry_count = 2;
        p.postpone_till = 2_000;
        store.set_channel_postponement(&p).await.unwrap();

        assert_eq!(store.list_channel_postponements().await.unwrap(), vec![p]);
        assert!(store.clear_channel_postponement(2).await.unwrap());
        assert!(!store.clear_channel_postponement(2).await.unwrap());
    }
}
