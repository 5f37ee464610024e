use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::inbound::{
    BatchId, ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
};

use super::codec::{
    conversation_key_from_row, format_timestamp, from_json, parse_optional_timestamp,
    parse_timestamp, parse_u32, to_json,
};
use super::{InboundEventRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
    correlation_id,
    workspace_id,
    channel,
    sender,
    status,
    retry_count,
    max_retries,
    payload_json,
    text,
    received_at,
    available_at,
    claimed_by,
    claimed_at,
    batch_id,
    last_error,
    updated_at
 FROM inbound_event";

pub struct SqlInboundEventRepository {
    pool: DbPool,
}

impl SqlInboundEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl InboundEventRepository for SqlInboundEventRepository {
    async fn insert_if_absent(&self, record: &InboundEventRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO inbound_event (
                correlation_id,
                conversation_key,
                workspace_id,
                channel,
                sender,
                status,
                retry_count,
                max_retries,
                payload_json,
                text,
                received_at,
                available_at,
                claimed_by,
                claimed_at,
                batch_id,
                last_error,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(correlation_id) DO NOTHING",
        )
        .bind(&record.correlation_id.0)
        .bind(record.conversation_key.as_key())
        .bind(&record.conversation_key.workspace_id)
        .bind(&record.conversation_key.channel)
        .bind(&record.conversation_key.sender)
        .bind(record.status.as_str())
        .bind(i64::from(record.retry_count))
        .bind(i64::from(record.max_retries))
        .bind(to_json("payload_json", &record.payload)?)
        .bind(&record.text)
        .bind(format_timestamp(&record.received_at))
        .bind(format_timestamp(&record.available_at))
        .bind(record.claimed_by.as_deref())
        .bind(record.claimed_at.as_ref().map(format_timestamp))
        .bind(record.batch_id.as_ref().map(|batch| batch.0.as_str()))
        .bind(record.last_error.as_deref())
        .bind(format_timestamp(&record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<InboundEventRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE correlation_id = ?"))
            .bind(&correlation_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(record_from_row).transpose()
    }

    async fn save(&self, record: &InboundEventRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE inbound_event SET
                status = ?,
                retry_count = ?,
                max_retries = ?,
                available_at = ?,
                claimed_by = ?,
                claimed_at = ?,
                batch_id = ?,
                last_error = ?,
                updated_at = ?
             WHERE correlation_id = ?",
        )
        .bind(record.status.as_str())
        .bind(i64::from(record.retry_count))
        .bind(i64::from(record.max_retries))
        .bind(format_timestamp(&record.available_at))
        .bind(record.claimed_by.as_deref())
        .bind(record.claimed_at.as_ref().map(format_timestamp))
        .bind(record.batch_id.as_ref().map(|batch| batch.0.as_str()))
        .bind(record.last_error.as_deref())
        .bind(format_timestamp(&record.updated_at))
        .bind(&record.correlation_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_if_unchanged(
        &self,
        record: &InboundEventRecord,
        expected_status: InboundStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE inbound_event SET
                status = ?,
                retry_count = ?,
                available_at = ?,
                claimed_by = ?,
                claimed_at = ?,
                batch_id = ?,
                last_error = ?,
                updated_at = ?
             WHERE correlation_id = ? AND status = ? AND updated_at = ?",
        )
        .bind(record.status.as_str())
        .bind(i64::from(record.retry_count))
        .bind(format_timestamp(&record.available_at))
        .bind(record.claimed_by.as_deref())
        .bind(record.claimed_at.as_ref().map(format_timestamp))
        .bind(record.batch_id.as_ref().map(|batch| batch.0.as_str()))
        .bind(record.last_error.as_deref())
        .bind(format_timestamp(&record.updated_at))
        .bind(&record.correlation_id.0)
        .bind(expected_status.as_str())
        .bind(format_timestamp(&expected_updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEventRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE (status IN ('pending', 'failed') AND available_at <= ?)
                OR (status = 'processing' AND claimed_at <= ?)
             ORDER BY received_at ASC, correlation_id ASC
             LIMIT ?"
        ))
        .bind(format_timestamp(&now))
        .bind(format_timestamp(&stale_before))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn list_pending_for_conversation(
        &self,
        key: &ConversationKey,
        received_from: DateTime<Utc>,
        received_until: DateTime<Utc>,
    ) -> Result<Vec<InboundEventRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE conversation_key = ?
               AND status = 'pending'
               AND received_at >= ?
               AND received_at <= ?
             ORDER BY received_at ASC, correlation_id ASC"
        ))
        .bind(key.as_key())
        .bind(format_timestamp(&received_from))
        .bind(format_timestamp(&received_until))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn oldest_open(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<InboundEventRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE conversation_key = ?
               AND status IN ('pending', 'failed', 'processing')
             ORDER BY received_at ASC, correlation_id ASC
             LIMIT 1"
        ))
        .bind(key.as_key())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn count_by_status(&self) -> Result<Vec<(InboundStatus, u64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM inbound_event GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("status")?;
                let status = InboundStatus::parse(&raw).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown inbound status `{raw}`"))
                })?;
                let count: i64 = row.try_get("count")?;
                Ok((status, u64::try_from(count).unwrap_or_default()))
            })
            .collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<InboundEventRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = InboundStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown inbound status `{status_raw}`")))?;
    let payload: String = row.try_get("payload_json")?;

    Ok(InboundEventRecord {
        correlation_id: CorrelationId(row.try_get("correlation_id")?),
        conversation_key: conversation_key_from_row(&row)?,
        status,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        payload: from_json("payload_json", &payload)?,
        text: row.try_get("text")?,
        received_at: parse_timestamp("received_at", row.try_get("received_at")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        batch_id: row.try_get::<Option<String>, _>("batch_id")?.map(BatchId),
        last_error: row.try_get("last_error")?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use parley_core::domain::inbound::{
        ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
    };

    use super::SqlInboundEventRepository;
    use crate::migrations;
    use crate::repositories::InboundEventRepository;
    use crate::{connect_with_settings, DbPool};

    fn event(id: &str, sender: &str, received_at: DateTime<Utc>) -> InboundEventRecord {
        InboundEventRecord::new_pending(
            CorrelationId(id.to_string()),
            ConversationKey::new("ws-1", "sms", sender),
            json!({"type": "text", "text": id}),
            id,
            3,
            received_at,
        )
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_ignored() {
        let pool = setup_pool().await;
        let repo = SqlInboundEventRepository::new(pool.clone());
        let record = event("evt-1", "+1", parse_ts("2026-03-01T10:00:00Z"));

        assert!(repo.insert_if_absent(&record).await.expect("insert"));
        assert!(!repo.insert_if_absent(&record).await.expect("replay insert"));

        let found = repo.find(&record.correlation_id).await.expect("find");
        assert_eq!(found, Some(record));

        pool.close().await;
    }

    #[tokio::test]
    async fn claimable_rows_include_due_retries_and_stale_claims_in_arrival_order() {
        let pool = setup_pool().await;
        let repo = SqlInboundEventRepository::new(pool.clone());
        let t0 = parse_ts("2026-03-01T10:00:00Z");

        let pending = event("evt-a", "+1", t0);
        let mut not_due = event("evt-b", "+2", t0 + Duration::seconds(1));
        not_due.status = InboundStatus::Failed;
        not_due.available_at = t0 + Duration::minutes(10);
        let mut stale = event("evt-c", "+3", t0 + Duration::seconds(2));
        stale.status = InboundStatus::Processing;
        stale.claimed_by = Some("worker-9".to_string());
        stale.claimed_at = Some(t0 - Duration::minutes(30));
        let mut done = event("evt-d", "+4", t0 + Duration::seconds(3));
        done.status = InboundStatus::Completed;

        for record in [&pending, &not_due, &stale, &done] {
            repo.insert_if_absent(record).await.expect("insert");
        }

        let now = t0 + Duration::minutes(1);
        let claimable =
            repo.list_claimable(now, now - Duration::minutes(5), 10).await.expect("list claimable");
        let ids: Vec<_> = claimable.iter().map(|record| record.correlation_id.0.as_str()).collect();
        assert_eq!(ids, vec!["evt-a", "evt-c"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn compare_and_set_rejects_a_second_claim() {
        let pool = setup_pool().await;
        let repo = SqlInboundEventRepository::new(pool.clone());
        let t0 = parse_ts("2026-03-01T10:00:00Z");
        let record = event("evt-1", "+1", t0);
        repo.insert_if_absent(&record).await.expect("insert");

        let mut first = record.clone();
        first.status = InboundStatus::Processing;
        first.claimed_by = Some("worker-1".to_string());
        first.claimed_at = Some(t0 + Duration::seconds(1));
        first.updated_at = t0 + Duration::seconds(1);

        let mut second = first.clone();
        second.claimed_by = Some("worker-2".to_string());

        assert!(repo
            .save_if_unchanged(&first, InboundStatus::Pending, record.updated_at)
            .await
            .expect("first claim"));
        assert!(!repo
            .save_if_unchanged(&second, InboundStatus::Pending, record.updated_at)
            .await
            .expect("second claim"));

        let stored = repo.find(&record.correlation_id).await.expect("find").expect("stored");
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-1"));

        pool.close().await;
    }

    #[tokio::test]
    async fn pending_window_query_is_scoped_to_conversation() {
        let pool = setup_pool().await;
        let repo = SqlInboundEventRepository::new(pool.clone());
        let t0 = parse_ts("2026-03-01T10:00:00Z");

        let inside = event("evt-1", "+1", t0 + Duration::seconds(3));
        let anchor = event("evt-0", "+1", t0);
        let late = event("evt-2", "+1", t0 + Duration::seconds(20));
        let other = event("evt-3", "+2", t0 + Duration::seconds(1));
        for record in [&inside, &anchor, &late, &other] {
            repo.insert_if_absent(record).await.expect("insert");
        }

        let window = repo
            .list_pending_for_conversation(
                &anchor.conversation_key,
                t0,
                t0 + Duration::milliseconds(7_500),
            )
            .await
            .expect("window");
        let ids: Vec<_> = window.iter().map(|record| record.correlation_id.0.as_str()).collect();
        assert_eq!(ids, vec!["evt-0", "evt-1"]);

        let counts = repo.count_by_status().await.expect("counts");
        assert_eq!(counts, vec![(InboundStatus::Pending, 4)]);

        pool.close().await;
    }

    #[tokio::test]
    async fn oldest_open_skips_finished_events_and_other_conversations() {
        let pool = setup_pool().await;
        let repo = SqlInboundEventRepository::new(pool.clone());
        let t0 = parse_ts("2026-03-01T10:00:00Z");

        let done = event("evt-0", "+1", t0);
        let retrying = event("evt-1", "+1", t0 + Duration::seconds(5));
        let newest = event("evt-2", "+1", t0 + Duration::seconds(9));
        let other = event("evt-3", "+2", t0 - Duration::seconds(60));
        for record in [&done, &retrying, &newest, &other] {
            repo.insert_if_absent(record).await.expect("insert");
        }
        let oldest = repo.oldest_open(&done.conversation_key).await.expect("oldest");
        assert_eq!(oldest.map(|record| record.correlation_id), Some(done.correlation_id.clone()));

        let mut completed = done.clone();
        completed.status = InboundStatus::Completed;
        repo.save(&completed).await.expect("complete");
        let mut failed = retrying.clone();
        failed.status = InboundStatus::Failed;
        failed.retry_count = 1;
        failed.available_at = t0 + Duration::seconds(30);
        repo.save(&failed).await.expect("fail");

        let oldest = repo.oldest_open(&done.conversation_key).await.expect("oldest");
        let oldest = oldest.expect("an open event");
        assert_eq!(oldest.correlation_id, retrying.correlation_id);
        assert_eq!(oldest.status, InboundStatus::Failed);

        let mut finished = newest.clone();
        finished.status = InboundStatus::DeadLettered;
        repo.save(&finished).await.expect("dlq");
        let mut finished = failed;
        finished.status = InboundStatus::Completed;
        repo.save(&finished).await.expect("complete retry");
        assert!(repo.oldest_open(&done.conversation_key).await.expect("oldest").is_none());

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
