//! Campaign repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{ActivityTxOps, push_not_in};
use crate::database::models::{
    ActivityLogDbModel, CampaignDbModel, CampaignMessageDbModel, CampaignStatus, ENTITY_CAMPAIGN,
    MessageOutcome, MessageStatus,
};
use crate::database::{begin_immediate, time::now_ms};
use crate::{Error, Result};

/// Campaign repository trait.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn get_campaign(&self, id: i64) -> Result<CampaignDbModel>;
    async fn create_campaign(&self, campaign: &CampaignDbModel) -> Result<i64>;
    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<CampaignDbModel>>;

    /// Force campaigns still `SCHEDULED` or `PAUSED` whose start is older than
    /// `cutoff_ms` to `FINISHED`. Returns the number of campaigns finished.
    async fn finish_expired(&self, cutoff_ms: i64) -> Result<u64>;

    /// Atomically move one due `SCHEDULED` campaign whose channel is not in
    /// `postponed_channels` to `SYNCHRONIZING`.
    async fn claim_next_scheduled(
        &self,
        now: i64,
        postponed_channels: &[i64],
    ) -> Result<Option<CampaignDbModel>>;

    /// Conditional status change. Returns `false` when the campaign is no
    /// longer in `from`.
    async fn transition(&self, id: i64, from: CampaignStatus, to: CampaignStatus) -> Result<bool>;

    // Messages
    async fn add_message(&self, message: &CampaignMessageDbModel) -> Result<i64>;
    async fn get_message(&self, id: i64) -> Result<CampaignMessageDbModel>;
    async fn list_scheduled_messages(&self, campaign_id: i64)
    -> Result<Vec<CampaignMessageDbModel>>;

    /// Apply replayed outcomes of one campaign in a single transaction.
    ///
    /// Only messages still `SCHEDULED` are updated, so replaying the same
    /// outcome twice never double-counts. Returns the number applied.
    async fn apply_outcomes(&self, campaign_id: i64, outcomes: &[MessageOutcome]) -> Result<u64>;
}

/// SQLx implementation of CampaignRepository.
pub struct SqlxCampaignRepository {
    pool: SqlitePool,
}

impl SqlxCampaignRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for SqlxCampaignRepository {
    async fn get_campaign(&self, id: i64) -> Result<CampaignDbModel> {
        sqlx::query_as::<_, CampaignDbModel>("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Campaign", id.to_string()))
    }

    async fn create_campaign(&self, campaign: &CampaignDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO campaigns (
                name, status, send_configuration_id, start_at, subject, html, text,
                lists, attachments, delivered, failed, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&campaign.name)
        .bind(&campaign.status)
        .bind(campaign.send_configuration_id)
        .bind(campaign.start_at)
        .bind(&campaign.subject)
        .bind(&campaign.html)
        .bind(&campaign.text)
        .bind(&campaign.lists)
        .bind(&campaign.attachments)
        .bind(campaign.delivered)
        .bind(campaign.failed)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<CampaignDbModel>> {
        let campaigns = sqlx::query_as::<_, CampaignDbModel>(
            "SELECT * FROM campaigns WHERE status = ? ORDER BY id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(campaigns)
    }

    async fn finish_expired(&self, cutoff_ms: i64) -> Result<u64> {
        let mut tx = begin_immediate(&self.pool).await?;

        let expired: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM campaigns
            WHERE status IN ('SCHEDULED', 'PAUSED') AND start_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .fetch_all(&mut *tx)
        .await?;

        let now = now_ms();
        for (id, status) in &expired {
            sqlx::query("UPDATE campaigns SET status = 'FINISHED', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let entry = ActivityLogDbModel::new(ENTITY_CAMPAIGN, *id, "FINISHED")
                .with_data(format!("{{\"reason\":\"retention\",\"from\":\"{}\"}}", status));
            ActivityTxOps::record(&mut tx, &entry).await?;
        }

        tx.commit().await?;
        Ok(expired.len() as u64)
    }

    async fn claim_next_scheduled(
        &self,
        now: i64,
        postponed_channels: &[i64],
    ) -> Result<Option<CampaignDbModel>> {
        let mut tx = begin_immediate(&self.pool).await?;

        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM campaigns WHERE status = 'SCHEDULED' AND start_at <= ");
        qb.push_bind(now);
        push_not_in(&mut qb, "send_configuration_id", postponed_channels);
        qb.push(" ORDER BY start_at, id LIMIT 1");

        let found = qb
            .build_query_as::<CampaignDbModel>()
            .fetch_optional(&mut *tx)
            .await?;
        let Some(mut campaign) = found else {
            tx.rollback().await?;
            return Ok(None);
        };

        let updated_at = now_ms();
        sqlx::query(
            "UPDATE campaigns SET status = 'SYNCHRONIZING', updated_at = ? WHERE id = ? AND status = 'SCHEDULED'",
        )
        .bind(updated_at)
        .bind(campaign.id)
        .execute(&mut *tx)
        .await?;
        ActivityTxOps::record(
            &mut tx,
            &ActivityLogDbModel::new(ENTITY_CAMPAIGN, campaign.id, "SYNCHRONIZING"),
        )
        .await?;

        tx.commit().await?;

        campaign.status = CampaignStatus::Synchronizing.as_str().to_string();
        campaign.updated_at = updated_at;
        Ok(Some(campaign))
    }

    async fn transition(&self, id: i64, from: CampaignStatus, to: CampaignStatus) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::invalid_transition(from.as_str(), to.as_str()));
        }

        let mut tx = begin_immediate(&self.pool).await?;
        let result =
            sqlx::query("UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(now_ms())
                .bind(id)
                .bind(from.as_str())
                .execute(&mut *tx)
                .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        ActivityTxOps::record(&mut tx, &ActivityLogDbModel::new(ENTITY_CAMPAIGN, id, to.as_str()))
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn add_message(&self, message: &CampaignMessageDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO campaign_messages (
                campaign_id, list_id, subscription_id, email, hash_email_piece,
                status, response, response_id, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.campaign_id)
        .bind(message.list_id)
        .bind(message.subscription_id)
        .bind(&message.email)
        .bind(message.hash_email_piece)
        .bind(&message.status)
        .bind(&message.response)
        .bind(&message.response_id)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_message(&self, id: i64) -> Result<CampaignMessageDbModel> {
        sqlx::query_as::<_, CampaignMessageDbModel>("SELECT * FROM campaign_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("CampaignMessage", id.to_string()))
    }

    async fn list_scheduled_messages(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<CampaignMessageDbModel>> {
        let messages = sqlx::query_as::<_, CampaignMessageDbModel>(
            "SELECT * FROM campaign_messages WHERE campaign_id = ? AND status = 'SCHEDULED' ORDER BY id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn apply_outcomes(&self, campaign_id: i64, outcomes: &[MessageOutcome]) -> Result<u64> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let mut tx = begin_immediate(&self.pool).await?;
        let now = now_ms();
        let mut delivered = 0i64;
        let mut failed = 0i64;

        for outcome in outcomes {
            let result = sqlx::query(
                r#"
                UPDATE campaign_messages
                SET status = ?, response = ?, response_id = ?, updated_at = ?
                WHERE id = ? AND campaign_id = ? AND status = 'SCHEDULED'
                "#,
            )
            .bind(outcome.status.as_str())
            .bind(&outcome.response)
            .bind(&outcome.response_id)
            .bind(now)
            .bind(outcome.source_id)
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }
            match outcome.status {
                MessageStatus::Sent => delivered += 1,
                MessageStatus::Failed => failed += 1,
                MessageStatus::Scheduled => {}
            }
        }

        if delivered + failed > 0 {
            sqlx::query(
                "UPDATE campaigns SET delivered = delivered + ?, failed = failed + ?, updated_at = ? WHERE id = ?",
            )
            .bind(delivered)
            .bind(failed)
            .bind(now)
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((delivered + failed) as u64)
    }
}
