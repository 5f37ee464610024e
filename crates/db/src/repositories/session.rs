use chrono::{DateTime, Utc};
use sqlx::Row;

use parley_core::domain::session::{SessionId, SessionMemory};

use super::codec::{format_timestamp, from_json, parse_timestamp, to_json};
use super::{RepositoryError, SessionRepository, StoredSession};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn find(&self, session_id: &SessionId) -> Result<Option<StoredSession>, RepositoryError> {
        let row = sqlx::query(
            "SELECT payload_json, expires_at FROM session_memory WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.try_get("payload_json")?;
        Ok(Some(StoredSession {
            memory: from_json("payload_json", &payload)?,
            expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        }))
    }

    async fn save(
        &self,
        memory: &SessionMemory,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO session_memory (
                session_id,
                workspace_id,
                state,
                payload_json,
                expires_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                state = excluded.state,
                payload_json = excluded.payload_json,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(&memory.session_id.0)
        .bind(&memory.workspace_id.0)
        .bind(memory.state.as_str())
        .bind(to_json("payload_json", memory)?)
        .bind(format_timestamp(&expires_at))
        .bind(format_timestamp(&memory.last_activity_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM session_memory WHERE session_id = ?")
            .bind(&session_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use parley_core::domain::cart::CartItem;
    use parley_core::domain::catalog::ProductId;
    use parley_core::domain::session::{SessionId, SessionMemory, WorkspaceId};
    use parley_core::flows::ConversationState;

    use super::SqlSessionRepository;
    use crate::migrations;
    use crate::repositories::SessionRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_session_repo_round_trips_aggregate_and_expiry() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());

        let now = parse_ts("2026-03-01T10:00:00Z");
        let mut memory = SessionMemory::new(
            SessionId("ws-1:sms:+5511".to_string()),
            WorkspaceId("ws-1".to_string()),
            None,
            now,
        );
        memory.cart_mut().add_item(CartItem::new(
            ProductId("soda".to_string()),
            None,
            "Soda",
            2,
            Decimal::new(450, 2),
        ));
        memory.transition(ConversationState::CollectingOrder);

        let expires_at = now + Duration::hours(24);
        repo.save(&memory, expires_at).await.expect("save session");

        let stored = repo.find(&memory.session_id).await.expect("find").expect("stored");
        assert_eq!(stored.memory, memory);
        assert_eq!(stored.expires_at, expires_at);

        memory.transition(ConversationState::AwaitingConfirmation);
        repo.save(&memory, expires_at + Duration::hours(1)).await.expect("overwrite");
        let stored = repo.find(&memory.session_id).await.expect("find").expect("stored");
        assert_eq!(stored.memory.state, ConversationState::AwaitingConfirmation);

        repo.delete(&memory.session_id).await.expect("delete");
        assert!(repo.find(&memory.session_id).await.expect("find").is_none());

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
