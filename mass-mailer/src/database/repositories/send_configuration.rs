//! Send configuration and file repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{FileDbModel, SendConfigurationDbModel};
use crate::{Error, Result};

/// Send configuration repository trait.
#[async_trait]
pub trait SendConfigurationRepository: Send + Sync {
    async fn get_send_configuration(&self, id: i64) -> Result<SendConfigurationDbModel>;
    async fn create_send_configuration(&self, config: &SendConfigurationDbModel) -> Result<i64>;
    async fn get_files(&self, ids: &[i64]) -> Result<Vec<FileDbModel>>;
}

/// SQLx implementation of SendConfigurationRepository.
pub struct SqlxSendConfigurationRepository {
    pool: SqlitePool,
}

impl SqlxSendConfigurationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SendConfigurationRepository for SqlxSendConfigurationRepository {
    async fn get_send_configuration(&self, id: i64) -> Result<SendConfigurationDbModel> {
        sqlx::query_as::<_, SendConfigurationDbModel>(
            "SELECT * FROM send_configurations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("SendConfiguration", id.to_string()))
    }

    async fn create_send_configuration(&self, config: &SendConfigurationDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO send_configurations (name, from_email, from_name, reply_to, max_per_second, settings, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.name)
        .bind(&config.from_email)
        .bind(&config.from_name)
        .bind(&config.reply_to)
        .bind(config.max_per_second)
        .bind(&config.settings)
        .bind(config.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_files(&self, ids: &[i64]) -> Result<Vec<FileDbModel>> {
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            let file = sqlx::query_as::<_, FileDbModel>("SELECT * FROM files WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::not_found("File", id.to_string()))?;
            files.push(file);
        }
        Ok(files)
    }
}
