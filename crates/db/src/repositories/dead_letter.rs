use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::conversation::DeadLetterRecord;
use parley_core::domain::inbound::CorrelationId;

use super::codec::{
    conversation_key_from_row, format_timestamp, from_json, parse_timestamp, parse_u32, to_json,
};
use super::{DeadLetterRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDeadLetterRepository {
    pool: DbPool,
}

impl SqlDeadLetterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DeadLetterRepository for SqlDeadLetterRepository {
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dead_letter (
                correlation_id,
                conversation_key,
                workspace_id,
                channel,
                sender,
                payload_json,
                retry_count,
                last_error,
                dead_lettered_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(correlation_id) DO UPDATE SET
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                dead_lettered_at = excluded.dead_lettered_at",
        )
        .bind(&record.correlation_id.0)
        .bind(record.conversation_key.as_key())
        .bind(&record.conversation_key.workspace_id)
        .bind(&record.conversation_key.channel)
        .bind(&record.conversation_key.sender)
        .bind(to_json("payload_json", &record.payload)?)
        .bind(i64::from(record.retry_count))
        .bind(&record.last_error)
        .bind(format_timestamp(&record.dead_lettered_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                correlation_id,
                workspace_id,
                channel,
                sender,
                payload_json,
                retry_count,
                last_error,
                dead_lettered_at
             FROM dead_letter
             ORDER BY dead_lettered_at DESC
             LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn take(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<DeadLetterRecord>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT
                correlation_id,
                workspace_id,
                channel,
                sender,
                payload_json,
                retry_count,
                last_error,
                dead_lettered_at
             FROM dead_letter
             WHERE correlation_id = ?",
        )
        .bind(&correlation_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let record = record_from_row(row)?;

        sqlx::query("DELETE FROM dead_letter WHERE correlation_id = ?")
            .bind(&correlation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(record))
    }
}

fn record_from_row(row: SqliteRow) -> Result<DeadLetterRecord, RepositoryError> {
    let payload: String = row.try_get("payload_json")?;
    Ok(DeadLetterRecord {
        correlation_id: CorrelationId(row.try_get("correlation_id")?),
        conversation_key: conversation_key_from_row(&row)?,
        payload: from_json("payload_json", &payload)?,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        last_error: row.try_get("last_error")?,
        dead_lettered_at: parse_timestamp("dead_lettered_at", row.try_get("dead_lettered_at")?)?,
    })
}
