use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::message::{MessageRole, StoredMessage};
use parley_core::domain::session::SessionId;

use super::codec::{format_timestamp, from_json, parse_timestamp, to_json};
use super::{MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn append(&self, message: &StoredMessage) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO message (session_id, external_id, role, content_json, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(&message.session_id.0)
        .bind(&message.external_id)
        .bind(message.role.as_str())
        .bind(to_json("content_json", &message.content)?)
        .bind(format_timestamp(&message.created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent(
        &self,
        session_id: &SessionId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT session_id, external_id, role, content_json, created_at
             FROM (
                SELECT id, session_id, external_id, role, content_json, created_at
                FROM message
                WHERE session_id = ? AND created_at >= ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
             )
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&session_id.0)
        .bind(format_timestamp(&since))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

fn message_from_row(row: SqliteRow) -> Result<StoredMessage, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;
    let content: String = row.try_get("content_json")?;

    Ok(StoredMessage {
        session_id: SessionId(row.try_get("session_id")?),
        external_id: row.try_get("external_id")?,
        role,
        content: from_json("content_json", &content)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use parley_core::domain::message::{ContentBlock, MessageRole, StoredMessage};
    use parley_core::domain::session::SessionId;

    use super::SqlMessageRepository;
    use crate::migrations;
    use crate::repositories::MessageRepository;
    use crate::{connect_with_settings, DbPool};

    fn message(external_id: &str, role: MessageRole, at: DateTime<Utc>) -> StoredMessage {
        StoredMessage {
            session_id: SessionId("ws-1:sms:+1".to_string()),
            external_id: external_id.to_string(),
            role,
            content: vec![ContentBlock::text(external_id)],
            created_at: at,
        }
    }

    #[tokio::test]
    async fn append_dedupes_by_external_id_and_recent_returns_tail_in_order() {
        let pool = setup_pool().await;
        let repo = SqlMessageRepository::new(pool.clone());
        let t0 = parse_ts("2026-03-01T10:00:00Z");

        for index in 0..5 {
            let role = if index % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            let stored = repo
                .append(&message(&format!("m-{index}"), role, t0 + Duration::seconds(index)))
                .await
                .expect("append");
            assert!(stored);
        }
        assert!(!repo
            .append(&message("m-4", MessageRole::User, t0 + Duration::seconds(9)))
            .await
            .expect("duplicate append"));

        let session = SessionId("ws-1:sms:+1".to_string());
        let recent = repo.recent(&session, t0, 3).await.expect("recent");
        let ids: Vec<_> = recent.iter().map(|message| message.external_id.as_str()).collect();
        assert_eq!(ids, vec!["m-2", "m-3", "m-4"]);

        let windowed =
            repo.recent(&session, t0 + Duration::seconds(4), 10).await.expect("recent since");
        assert_eq!(windowed.len(), 1);

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
