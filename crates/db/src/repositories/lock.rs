use chrono::{DateTime, Utc};

use parley_core::domain::inbound::ConversationKey;

use super::codec::format_timestamp;
use super::{ConversationLockRepository, RepositoryError};
use crate::DbPool;

/// Lease rows keyed by conversation. A crashed holder's lease lapses at
/// `expires_at` and the next worker takes it over.
pub struct SqlConversationLockRepository {
    pool: DbPool,
}

impl SqlConversationLockRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationLockRepository for SqlConversationLockRepository {
    async fn try_acquire(
        &self,
        key: &ConversationKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO conversation_lock (conversation_key, owner, expires_at)
             VALUES (?, ?, ?)
             ON CONFLICT(conversation_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE conversation_lock.expires_at <= ? OR conversation_lock.owner = excluded.owner",
        )
        .bind(key.as_key())
        .bind(owner)
        .bind(format_timestamp(&expires_at))
        .bind(format_timestamp(&now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        key: &ConversationKey,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE conversation_lock SET expires_at = ?
             WHERE conversation_key = ? AND owner = ?",
        )
        .bind(format_timestamp(&expires_at))
        .bind(key.as_key())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &ConversationKey, owner: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM conversation_lock WHERE conversation_key = ? AND owner = ?")
            .bind(key.as_key())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
