//! Transactional operations for the activity log.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::ActivityLogDbModel;

/// Activity log writes that join the caller's transaction.
///
/// These methods do NOT commit; the caller commits or rolls back.
pub struct ActivityTxOps;

impl ActivityTxOps {
    pub async fn record(tx: &mut SqliteConnection, entry: &ActivityLogDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (id, entity_type, entity_id, activity, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.entity_type)
        .bind(entry.entity_id)
        .bind(&entry.activity)
        .bind(&entry.data)
        .bind(entry.created_at)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn list_for_entity(
        tx: &mut SqliteConnection,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Vec<ActivityLogDbModel>> {
        let entries = sqlx::query_as::<_, ActivityLogDbModel>(
            "SELECT * FROM activity_log WHERE entity_type = ? AND entity_id = ? ORDER BY created_at, id",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(tx)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ENTITY_CAMPAIGN;
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE activity_log (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                activity TEXT NOT NULL,
                data TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_record_is_rolled_back_with_transaction() {
        let pool = setup_test_db().await;

        let mut tx = pool.begin().await.unwrap();
        ActivityTxOps::record(&mut tx, &ActivityLogDbModel::new(ENTITY_CAMPAIGN, 1, "SENDING"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let entries = ActivityTxOps::list_for_entity(&mut conn, ENTITY_CAMPAIGN, 1)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_record_with_data() {
        let pool = setup_test_db().await;

        let mut tx = pool.begin().await.unwrap();
        let entry = ActivityLogDbModel::new(ENTITY_CAMPAIGN, 2, "FINISHED").with_data("{\"n\":1}");
        ActivityTxOps::record(&mut tx, &entry).await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let entries = ActivityTxOps::list_for_entity(&mut conn, ENTITY_CAMPAIGN, 2)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].activity, "FINISHED");
        assert_eq!(entries[0].data.as_deref(), Some("{\"n\":1}"));
    }
}
