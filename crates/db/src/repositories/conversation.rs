use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::conversation::ConversationRecord;
use parley_core::domain::inbound::ConversationKey;
use parley_core::domain::session::{CustomerId, SessionId};

use super::codec::{conversation_key_from_row, format_timestamp, parse_timestamp, parse_u32};
use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn find(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                workspace_id,
                channel,
                sender,
                session_id,
                customer_id,
                consecutive_failures,
                automation_enabled,
                handoff_reason,
                updated_at
             FROM conversation
             WHERE conversation_key = ?",
        )
        .bind(key.as_key())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn save(&self, record: &ConversationRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation (
                conversation_key,
                workspace_id,
                channel,
                sender,
                session_id,
                customer_id,
                consecutive_failures,
                automation_enabled,
                handoff_reason,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_key) DO UPDATE SET
                session_id = excluded.session_id,
                customer_id = excluded.customer_id,
                consecutive_failures = excluded.consecutive_failures,
                automation_enabled = excluded.automation_enabled,
                handoff_reason = excluded.handoff_reason,
                updated_at = excluded.updated_at",
        )
        .bind(record.conversation_key.as_key())
        .bind(&record.conversation_key.workspace_id)
        .bind(&record.conversation_key.channel)
        .bind(&record.conversation_key.sender)
        .bind(&record.session_id.0)
        .bind(record.customer_id.as_ref().map(|customer| customer.0.as_str()))
        .bind(i64::from(record.consecutive_failures))
        .bind(record.automation_enabled)
        .bind(record.handoff_reason.as_deref())
        .bind(format_timestamp(&record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_handoffs(&self) -> Result<Vec<ConversationRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                workspace_id,
                channel,
                sender,
                session_id,
                customer_id,
                consecutive_failures,
                automation_enabled,
                handoff_reason,
                updated_at
             FROM conversation
             WHERE automation_enabled = 0
             ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<ConversationRecord, RepositoryError> {
    Ok(ConversationRecord {
        conversation_key: conversation_key_from_row(&row)?,
        session_id: SessionId(row.try_get("session_id")?),
        customer_id: row.try_get::<Option<String>, _>("customer_id")?.map(CustomerId),
        consecutive_failures: parse_u32(
            "consecutive_failures",
            row.try_get("consecutive_failures")?,
        )?,
        automation_enabled: row.try_get("automation_enabled")?,
        handoff_reason: row.try_get("handoff_reason")?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
