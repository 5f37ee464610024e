//! Deterministic inbound-event lifecycle.
//!
//! Every transition of an [`InboundEventRecord`] (claim, complete, fail,
//! requeue, dead-letter) is decided here as a pure function of the record and
//! the supplied clock. Repositories persist the results; the ingestion pipeline
//! sequences them.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::domain::inbound::{
    BatchId, ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestionEngineConfig {
    /// How long before a processing claim is considered abandoned.
    pub claim_timeout_seconds: i64,
    pub default_max_retries: u32,
    pub retry_backoff_multiplier: u32,
    pub retry_base_delay_seconds: i64,
    /// Quiet period during which later messages join the anchor's batch.
    pub coalesce_window_ms: i64,
    /// Batch size cap, anchor included.
    pub max_batch_size: usize,
    /// Delay applied when the conversation lock is busy.
    pub requeue_delay_ms: i64,
}

impl Default for IngestionEngineConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 360,
            default_max_retries: 3,
            retry_backoff_multiplier: 2,
            retry_base_delay_seconds: 5,
            coalesce_window_ms: 7_500,
            max_batch_size: 5,
            requeue_delay_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IngestionError {
    #[error("invalid inbound transition for {correlation_id} from {from:?} to {to:?}")]
    InvalidTransition { correlation_id: String, from: InboundStatus, to: InboundStatus },
    #[error("inbound event {0} is already claimed by {1}")]
    ClaimConflict(String, String),
    #[error("inbound event {0} is not yet available")]
    NotYetAvailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    Retry,
    DeadLetter,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailureOutcome {
    pub record: InboundEventRecord,
    pub dead_lettered: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DeterministicIngestionEngine {
    config: IngestionEngineConfig,
}

impl DeterministicIngestionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: IngestionEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IngestionEngineConfig {
        &self.config
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::milliseconds(self.config.coalesce_window_ms.max(0))
    }

    pub fn record(
        &self,
        correlation_id: CorrelationId,
        conversation_key: ConversationKey,
        payload: Value,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> InboundEventRecord {
        InboundEventRecord::new_pending(
            correlation_id,
            conversation_key,
            payload,
            text,
            self.config.default_max_retries,
            received_at,
        )
    }

    pub fn is_stale(&self, record: &InboundEventRecord, now: DateTime<Utc>) -> bool {
        record.status == InboundStatus::Processing
            && record.claimed_at.is_some_and(|claimed_at| {
                claimed_at + Duration::seconds(self.config.claim_timeout_seconds) <= now
            })
    }

    pub fn is_claimable(&self, record: &InboundEventRecord, now: DateTime<Utc>) -> bool {
        match record.status {
            InboundStatus::Pending | InboundStatus::Failed => record.available_at <= now,
            InboundStatus::Processing => self.is_stale(record, now),
            InboundStatus::Completed | InboundStatus::DeadLettered => false,
        }
    }

    /// Pending|Failed -> Processing, or steals an abandoned Processing claim.
    pub fn claim(
        &self,
        mut record: InboundEventRecord,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<InboundEventRecord, IngestionError> {
        let correlation_id = record.correlation_id.0.clone();
        match record.status {
            InboundStatus::Pending | InboundStatus::Failed => {
                if now < record.available_at {
                    return Err(IngestionError::NotYetAvailable(correlation_id));
                }
            }
            InboundStatus::Processing => {
                if !self.is_stale(&record, now) {
                    return Err(IngestionError::ClaimConflict(
                        correlation_id,
                        record.claimed_by.clone().unwrap_or_default(),
                    ));
                }
            }
            InboundStatus::Completed | InboundStatus::DeadLettered => {
                return Err(IngestionError::InvalidTransition {
                    correlation_id,
                    from: record.status,
                    to: InboundStatus::Processing,
                });
            }
        }

        record.status = InboundStatus::Processing;
        record.claimed_by = Some(worker_id.into());
        record.claimed_at = Some(now);
        record.updated_at = now;
        Ok(record)
    }

    /// Processing -> Completed. Completing an already completed record is a no-op.
    pub fn complete(
        &self,
        mut record: InboundEventRecord,
        now: DateTime<Utc>,
    ) -> Result<InboundEventRecord, IngestionError> {
        match record.status {
            InboundStatus::Completed => return Ok(record),
            InboundStatus::Processing | InboundStatus::Pending => {}
            from => {
                return Err(IngestionError::InvalidTransition {
                    correlation_id: record.correlation_id.0.clone(),
                    from,
                    to: InboundStatus::Completed,
                })
            }
        }

        record.status = InboundStatus::Completed;
        record.claimed_by = None;
        record.claimed_at = None;
        record.last_error = None;
        record.updated_at = now;
        Ok(record)
    }

    /// Processing -> Failed with exponential backoff, or -> dlq once retries
    /// are exhausted or the policy says so.
    pub fn fail(
        &self,
        mut record: InboundEventRecord,
        error: impl Into<String>,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, IngestionError> {
        if record.status.is_terminal() {
            return Err(IngestionError::InvalidTransition {
                correlation_id: record.correlation_id.0.clone(),
                from: record.status,
                to: InboundStatus::Failed,
            });
        }

        let retry = policy == RetryPolicy::Retry && record.retry_count < record.max_retries;
        record.last_error = Some(error.into());
        record.claimed_by = None;
        record.claimed_at = None;
        record.updated_at = now;

        if retry {
            let multiplier =
                self.config.retry_backoff_multiplier.saturating_pow(record.retry_count);
            let backoff_seconds = self.config.retry_base_delay_seconds * i64::from(multiplier);
            record.status = InboundStatus::Failed;
            record.retry_count += 1;
            record.available_at = now + Duration::seconds(backoff_seconds);
            Ok(FailureOutcome { record, dead_lettered: false })
        } else {
            record.status = InboundStatus::DeadLettered;
            Ok(FailureOutcome { record, dead_lettered: true })
        }
    }

    /// Lock contention: back to Pending after a fixed delay without consuming a retry.
    pub fn requeue(
        &self,
        mut record: InboundEventRecord,
        now: DateTime<Utc>,
    ) -> InboundEventRecord {
        record.status = InboundStatus::Pending;
        record.claimed_by = None;
        record.claimed_at = None;
        record.batch_id = None;
        record.available_at = now + Duration::milliseconds(self.config.requeue_delay_ms.max(0));
        record.updated_at = now;
        record
    }

    /// Picks the anchor plus still-pending events of the same conversation that
    /// arrived within the coalescing window, in arrival order, capped.
    pub fn select_batch(
        &self,
        anchor: &InboundEventRecord,
        candidates: &[InboundEventRecord],
    ) -> Vec<InboundEventRecord> {
        let window_end = anchor.received_at + self.coalesce_window();
        let mut joined: Vec<InboundEventRecord> = candidates
            .iter()
            .filter(|candidate| candidate.correlation_id != anchor.correlation_id)
            .filter(|candidate| candidate.conversation_key == anchor.conversation_key)
            .filter(|candidate| candidate.status == InboundStatus::Pending)
            .filter(|candidate| {
                candidate.received_at >= anchor.received_at && candidate.received_at <= window_end
            })
            .cloned()
            .collect();
        joined.sort_by(|left, right| {
            left.received_at
                .cmp(&right.received_at)
                .then_with(|| left.correlation_id.0.cmp(&right.correlation_id.0))
        });
        joined.truncate(self.config.max_batch_size.saturating_sub(1));

        let mut batch = Vec::with_capacity(joined.len() + 1);
        batch.push(anchor.clone());
        batch.extend(joined);
        batch
    }

    pub fn assign_batch(
        &self,
        batch: Vec<InboundEventRecord>,
        batch_id: &BatchId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<InboundEventRecord> {
        batch
            .into_iter()
            .map(|mut record| {
                record.batch_id = Some(batch_id.clone());
                record.status = InboundStatus::Processing;
                record.claimed_by = Some(worker_id.to_owned());
                record.claimed_at = Some(now);
                record.updated_at = now;
                record
            })
            .collect()
    }
}

/// Joins batched message texts in arrival order. A single message is passed
/// through unlabelled; several become `[1] first\n[2] second`.
pub fn concatenate_batch(batch: &[InboundEventRecord]) -> String {
    let texts: Vec<&str> = batch
        .iter()
        .map(|record| record.text.trim())
        .filter(|text| !text.is_empty())
        .collect();
    match texts.as_slice() {
        [] => String::new(),
        [single] => (*single).to_owned(),
        many => many
            .iter()
            .enumerate()
            .map(|(index, text)| format!("[{}] {}", index + 1, text))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{
        concatenate_batch, DeterministicIngestionEngine, IngestionEngineConfig, IngestionError,
        RetryPolicy,
    };
    use crate::domain::inbound::{
        BatchId, ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
    };

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid timestamp")
    }

    fn event(
        engine: &DeterministicIngestionEngine,
        id: &str,
        sender: &str,
        text: &str,
        offset_ms: i64,
    ) -> InboundEventRecord {
        engine.record(
            CorrelationId(id.to_owned()),
            ConversationKey::new("ws", "whatsapp", sender),
            json!({"type": "text", "text": text}),
            text,
            t0() + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn claim_complete_happy_path() {
        let engine = DeterministicIngestionEngine::new();
        let record = event(&engine, "evt-1", "alice", "hi", 0);

        let claimed = engine.claim(record, "worker-1", t0()).expect("claim");
        assert_eq!(claimed.status, InboundStatus::Processing);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));

        let completed = engine.complete(claimed, t0()).expect("complete");
        assert_eq!(completed.status, InboundStatus::Completed);
        assert!(completed.claimed_by.is_none());

        let replay = engine.complete(completed.clone(), t0()).expect("idempotent complete");
        assert_eq!(replay, completed);
        assert!(matches!(
            engine.claim(completed, "worker-2", t0()),
            Err(IngestionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn fresh_claim_cannot_be_stolen_but_stale_claim_can() {
        let engine = DeterministicIngestionEngine::new();
        let pending = event(&engine, "evt-1", "alice", "hi", 0);
        let claimed = engine.claim(pending, "worker-1", t0()).expect("claim");

        let early = engine.claim(claimed.clone(), "worker-2", t0() + Duration::seconds(10));
        assert_eq!(
            early,
            Err(IngestionError::ClaimConflict("evt-1".to_owned(), "worker-1".to_owned()))
        );

        let later = t0() + Duration::seconds(361);
        assert!(engine.is_stale(&claimed, later));
        let stolen = engine.claim(claimed, "worker-2", later).expect("steal stale claim");
        assert_eq!(stolen.claimed_by.as_deref(), Some("worker-2"));
    }

    #[test]
    fn failures_back_off_exponentially_then_dead_letter() {
        let engine = DeterministicIngestionEngine::new();
        let mut record = event(&engine, "evt-1", "alice", "hi", 0);
        let mut now = t0();
        let mut delays = Vec::new();

        for _ in 0..3 {
            record = engine.claim(record, "worker-1", now).expect("claim");
            let outcome = engine.fail(record, "boom", RetryPolicy::Retry, now).expect("fail");
            assert!(!outcome.dead_lettered);
            record = outcome.record;
            assert_eq!(record.status, InboundStatus::Failed);
            delays.push((record.available_at - now).num_seconds());
            now = record.available_at;
        }
        assert_eq!(delays, vec![5, 10, 20]);
        assert_eq!(record.retry_count, 3);

        record = engine.claim(record, "worker-1", now).expect("claim");
        let outcome = engine.fail(record, "boom again", RetryPolicy::Retry, now).expect("fail");
        assert!(outcome.dead_lettered);
        assert_eq!(outcome.record.status, InboundStatus::DeadLettered);
        assert_eq!(outcome.record.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn failed_record_is_not_claimable_before_backoff_elapses() {
        let engine = DeterministicIngestionEngine::new();
        let pending = event(&engine, "evt-1", "alice", "hi", 0);
        let claimed = engine.claim(pending, "worker-1", t0()).expect("claim");
        let failed = engine.fail(claimed, "boom", RetryPolicy::Retry, t0()).expect("fail").record;

        assert!(!engine.is_claimable(&failed, t0() + Duration::seconds(4)));
        assert_eq!(
            engine.claim(failed.clone(), "worker-1", t0() + Duration::seconds(4)),
            Err(IngestionError::NotYetAvailable("evt-1".to_owned()))
        );
        assert!(engine.is_claimable(&failed, t0() + Duration::seconds(5)));
    }

    #[test]
    fn requeue_does_not_consume_a_retry() {
        let engine = DeterministicIngestionEngine::new();
        let pending = event(&engine, "evt-1", "alice", "hi", 0);
        let claimed = engine.claim(pending, "worker-1", t0()).expect("claim");
        let requeued = engine.requeue(claimed, t0());

        assert_eq!(requeued.status, InboundStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.available_at, t0() + Duration::milliseconds(2_000));
    }

    #[test]
    fn batch_selection_respects_key_window_cap_and_order() {
        let engine = DeterministicIngestionEngine::with_config(IngestionEngineConfig {
            max_batch_size: 3,
            ..IngestionEngineConfig::default()
        });
        let anchor = event(&engine, "evt-1", "alice", "2 sodas", 0);
        let candidates = vec![
            event(&engine, "evt-4", "alice", "and chips", 6_000),
            event(&engine, "evt-2", "alice", "1 water", 1_000),
            event(&engine, "evt-3", "bob", "hello", 2_000),
            event(&engine, "evt-5", "alice", "too late", 9_000),
            event(&engine, "evt-6", "alice", "over cap", 7_000),
        ];

        let batch = engine.select_batch(&anchor, &candidates);
        let ids: Vec<_> = batch.iter().map(|record| record.correlation_id.0.as_str()).collect();
        assert_eq!(ids, vec!["evt-1", "evt-2", "evt-4"]);

        let assigned = engine.assign_batch(batch, &BatchId("b-1".to_owned()), "worker-1", t0());
        assert!(assigned.iter().all(|record| record.status == InboundStatus::Processing
            && record.batch_id == Some(BatchId("b-1".to_owned()))));
        assert_eq!(concatenate_batch(&assigned), "[1] 2 sodas\n[2] 1 water\n[3] and chips");
    }

    #[test]
    fn single_message_batch_is_not_labelled() {
        let engine = DeterministicIngestionEngine::new();
        let anchor = event(&engine, "evt-1", "alice", "  hello  ", 0);
        assert_eq!(concatenate_batch(&[anchor]), "hello");
        assert_eq!(concatenate_batch(&[]), "");
    }
}
