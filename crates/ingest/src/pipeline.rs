//! Inbound pipeline: durable ledger, per-conversation lock, coalescing,
//! one orchestrator turn per batch, then delivery and bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_agent::runtime::HANDOFF_REPLY;
use parley_agent::{Orchestrator, TurnError, TurnInput, TurnLease};
use parley_core::config::AppConfig;
use parley_core::domain::conversation::{ConversationRecord, DeadLetterRecord};
use parley_core::domain::inbound::{
    BatchId, ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
};
use parley_core::domain::reply::OutboundReply;
use parley_core::domain::session::{CustomerId, WorkspaceId};
use parley_core::flows::ConversationState;
use parley_core::ingestion_engine::{
    concatenate_batch, DeterministicIngestionEngine, IngestionEngineConfig, IngestionError,
    RetryPolicy,
};
use parley_db::repositories::{
    ConversationLockRepository, ConversationRepository, DeadLetterRepository,
    InboundEventRepository, RepositoryError,
};
use parley_db::{SessionStore, SessionStoreError};

use crate::events::InboundEnvelope;
use crate::outbound::OutboundChannel;

const FAILURE_HANDOFF_REASON: &str = "repeated processing failures";
const DEAD_LETTER_HANDOFF_REASON: &str = "message moved to dead-letter queue";
const AGENT_HANDOFF_REASON: &str = "escalated by the agent";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// The correlation id was already recorded; nothing changed.
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Unknown, terminal, not yet due, or claimed by someone else.
    Skipped,
    /// Conversation lock was busy; the event goes back to pending.
    Requeued,
    /// An older message of the conversation is still waiting on its retry
    /// backoff; the event goes back to pending behind it.
    Deferred,
    /// The conversation lease was lost mid-turn; nothing was committed and
    /// the batch is pending again.
    Abandoned { batch_size: usize },
    /// Conversation is with a human; the batch was completed without a reply.
    Silenced { batch_size: usize },
    Processed { batch_size: usize, handoff: bool },
    Failed { batch_size: usize, dead_lettered: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSettings {
    pub lock_ttl: Duration,
    /// Consecutive failed turns before the conversation is handed to a human.
    pub failure_threshold: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { lock_ttl: Duration::seconds(330), failure_threshold: 2 }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let defaults = Self::default();
        Self {
            lock_ttl: i64::try_from(config.ingestion.lock_ttl_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(defaults.lock_ttl),
            failure_threshold: config.agent.failure_threshold.max(1),
        }
    }
}

/// Lifecycle engine tuned by the `[ingestion]` section.
pub fn engine_from_config(config: &AppConfig) -> DeterministicIngestionEngine {
    let ingestion = &config.ingestion;
    let defaults = IngestionEngineConfig::default();
    let signed = |value: u64, fallback: i64| i64::try_from(value).unwrap_or(fallback);
    DeterministicIngestionEngine::with_config(IngestionEngineConfig {
        claim_timeout_seconds: signed(ingestion.claim_timeout_secs, defaults.claim_timeout_seconds),
        default_max_retries: ingestion.max_retries,
        retry_base_delay_seconds: signed(
            ingestion.retry_base_delay_secs,
            defaults.retry_base_delay_seconds,
        ),
        coalesce_window_ms: signed(ingestion.coalesce_window_ms, defaults.coalesce_window_ms),
        max_batch_size: ingestion.max_batch_size.max(1),
        requeue_delay_ms: signed(ingestion.requeue_delay_ms, defaults.requeue_delay_ms),
        ..defaults
    })
}

pub struct PipelineRepositories {
    pub inbound: Arc<dyn InboundEventRepository>,
    pub locks: Arc<dyn ConversationLockRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
}

pub struct IngestionPipeline {
    engine: DeterministicIngestionEngine,
    inbound: Arc<dyn InboundEventRepository>,
    locks: Arc<dyn ConversationLockRepository>,
    conversations: Arc<dyn ConversationRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    orchestrator: Arc<Orchestrator>,
    outbound: Arc<dyn OutboundChannel>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    pub fn new(
        engine: DeterministicIngestionEngine,
        repositories: PipelineRepositories,
        orchestrator: Arc<Orchestrator>,
        outbound: Arc<dyn OutboundChannel>,
    ) -> Self {
        Self {
            engine,
            inbound: repositories.inbound,
            locks: repositories.locks,
            conversations: repositories.conversations,
            dead_letters: repositories.dead_letters,
            orchestrator,
            outbound,
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn engine(&self) -> &DeterministicIngestionEngine {
        &self.engine
    }

    pub fn inbound(&self) -> &Arc<dyn InboundEventRepository> {
        &self.inbound
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterRepository> {
        &self.dead_letters
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationRepository> {
        &self.conversations
    }

    pub fn sessions(&self) -> &SessionStore {
        self.orchestrator.sessions()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.orchestrator.sessions().now()
    }

    /// Records the envelope as a pending event. Re-delivery of a known
    /// correlation id is acknowledged without side effects.
    pub async fn ingest(&self, envelope: &InboundEnvelope) -> Result<IngestOutcome, PipelineError> {
        let text = envelope.payload.extract_text().unwrap_or_default();
        let payload = serde_json::to_value(envelope)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let received_at = envelope.received_at.unwrap_or_else(|| self.now());
        let record = self.engine.record(
            envelope.correlation_id(),
            envelope.conversation_key(),
            payload,
            text,
            received_at,
        );

        if !self.inbound.insert_if_absent(&record).await? {
            info!(
                event_name = "ingress.duplicate",
                correlation_id = %record.correlation_id.0,
                conversation_key = %record.conversation_key,
                "duplicate inbound event ignored"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        info!(
            event_name = "ingress.accepted",
            correlation_id = %record.correlation_id.0,
            conversation_key = %record.conversation_key,
            payload_type = envelope.payload.kind(),
            "inbound event recorded"
        );
        Ok(IngestOutcome::Accepted)
    }

    /// Events a worker may pick up right now, oldest first.
    pub async fn claimable(&self, limit: usize) -> Result<Vec<InboundEventRecord>, PipelineError> {
        let now = self.now();
        let stale_before = now - Duration::seconds(self.engine.config().claim_timeout_seconds);
        Ok(self.inbound.list_claimable(now, stale_before, limit).await?)
    }

    pub async fn process(
        &self,
        correlation_id: &CorrelationId,
        worker_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some(record) = self.inbound.find(correlation_id).await? else {
            warn!(
                event_name = "ingress.unknown_event",
                correlation_id = %correlation_id.0,
                "no inbound record for correlation id"
            );
            return Ok(ProcessOutcome::Skipped);
        };

        let now = self.now();
        if !self.engine.is_claimable(&record, now) {
            debug!(
                event_name = "ingress.not_claimable",
                correlation_id = %correlation_id.0,
                status = record.status.as_str(),
                "inbound event is not claimable"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let (expected_status, expected_updated_at) = (record.status, record.updated_at);
        let anchor = self.engine.claim(record, worker_id, now)?;
        if !self.inbound.save_if_unchanged(&anchor, expected_status, expected_updated_at).await? {
            debug!(
                event_name = "ingress.claim_lost",
                correlation_id = %correlation_id.0,
                worker_id,
                "another worker claimed the event first"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let key = anchor.conversation_key.clone();
        let lock_expires_at = now + self.settings.lock_ttl;
        if !self.locks.try_acquire(&key, worker_id, now, lock_expires_at).await? {
            let claimed_at = anchor.updated_at;
            let requeued = self.engine.requeue(anchor, self.now());
            self.inbound.save_if_unchanged(&requeued, InboundStatus::Processing, claimed_at).await?;
            info!(
                event_name = "ingress.requeued",
                correlation_id = %correlation_id.0,
                conversation_key = %key,
                "conversation busy; event requeued"
            );
            return Ok(ProcessOutcome::Requeued);
        }

        let result = self.process_locked(anchor, worker_id).await;
        if let Err(error) = self.locks.release(&key, worker_id).await {
            warn!(
                event_name = "ingress.lock_release_failed",
                conversation_key = %key,
                error = %error,
                "failed to release conversation lock"
            );
        }
        result
    }

    async fn process_locked(
        &self,
        anchor: InboundEventRecord,
        worker_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some(anchor) = self.oldest_first(anchor, worker_id).await? else {
            return Ok(ProcessOutcome::Deferred);
        };
        let batch = self.gather_batch(anchor, worker_id).await?;
        if batch.is_empty() {
            return Ok(ProcessOutcome::Skipped);
        }
        let key = batch[0].conversation_key.clone();
        let correlation_id = batch[0].correlation_id.0.clone();
        let batch_size = batch.len();

        let lease: Arc<dyn TurnLease> = Arc::new(ConversationLease {
            locks: Arc::clone(&self.locks),
            orchestrator: Arc::clone(&self.orchestrator),
            key: key.clone(),
            owner: worker_id.to_string(),
            ttl: self.settings.lock_ttl,
        });
        if !lease.renew().await {
            self.requeue_all(batch).await?;
            return Ok(ProcessOutcome::Abandoned { batch_size });
        }

        let mut conversation = match self.conversations.find(&key).await? {
            Some(conversation) => conversation,
            None => ConversationRecord::new(key.clone(), self.now()),
        };
        if let Some(customer) = customer_of(&batch[0]) {
            conversation.customer_id = Some(customer);
        }

        if conversation.in_handoff() {
            info!(
                event_name = "ingress.silenced",
                correlation_id = %correlation_id,
                conversation_key = %key,
                batch_size,
                "conversation is with a human; batch completed without reply"
            );
            self.complete_all(batch).await?;
            return Ok(ProcessOutcome::Silenced { batch_size });
        }

        let input = TurnInput {
            session_id: conversation.session_id.clone(),
            workspace_id: WorkspaceId(key.workspace_id.clone()),
            customer_id: conversation.customer_id.clone(),
            correlation_id: correlation_id.clone(),
            text: concatenate_batch(&batch),
        };

        match self.orchestrator.process_turn_with_lease(input, lease).await {
            Ok(outcome) => {
                conversation.consecutive_failures = 0;
                let handoff = outcome.is_handoff();
                if handoff {
                    conversation.automation_enabled = false;
                    conversation.handoff_reason = Some(AGENT_HANDOFF_REASON.to_string());
                }
                conversation.updated_at = self.now();
                self.conversations.save(&conversation).await?;

                if let Some(reply) = &outcome.reply {
                    self.deliver(&key, reply, &correlation_id).await;
                }
                self.complete_all(batch).await?;
                info!(
                    event_name = "ingress.processed",
                    correlation_id = %correlation_id,
                    conversation_key = %key,
                    batch_size,
                    new_state = %outcome.new_state,
                    tools_invoked = outcome.tools_invoked.len(),
                    tokens_used = outcome.tokens_used,
                    "batch processed"
                );
                Ok(ProcessOutcome::Processed { batch_size, handoff })
            }
            Err(TurnError::LeaseLost { checkpoint }) => {
                warn!(
                    event_name = "ingress.turn_abandoned",
                    correlation_id = %correlation_id,
                    conversation_key = %key,
                    checkpoint,
                    batch_size,
                    "conversation lease lost; batch returned to pending"
                );
                self.requeue_all(batch).await?;
                Ok(ProcessOutcome::Abandoned { batch_size })
            }
            Err(error) => {
                let message = error.to_string();
                conversation.consecutive_failures += 1;
                warn!(
                    event_name = "ingress.turn_failed",
                    correlation_id = %correlation_id,
                    conversation_key = %key,
                    consecutive_failures = conversation.consecutive_failures,
                    error = %message,
                    "turn failed"
                );
                if conversation.consecutive_failures >= self.settings.failure_threshold {
                    self.force_handoff(&mut conversation, FAILURE_HANDOFF_REASON, &correlation_id)
                        .await;
                }

                let dead_lettered = self.fail_all(batch, &message).await?;
                if dead_lettered > 0 && !conversation.in_handoff() {
                    self.force_handoff(
                        &mut conversation,
                        DEAD_LETTER_HANDOFF_REASON,
                        &correlation_id,
                    )
                    .await;
                }
                conversation.updated_at = self.now();
                self.conversations.save(&conversation).await?;
                Ok(ProcessOutcome::Failed { batch_size, dead_lettered })
            }
        }
    }

    /// Keeps a conversation in arrival order. When an older event of the
    /// same conversation is still open, the anchor goes back to pending and
    /// the older event becomes the anchor, or the turn waits for it when it
    /// is not due yet. `None` means nothing should run now.
    async fn oldest_first(
        &self,
        anchor: InboundEventRecord,
        worker_id: &str,
    ) -> Result<Option<InboundEventRecord>, PipelineError> {
        let Some(oldest) = self.inbound.oldest_open(&anchor.conversation_key).await? else {
            return Ok(Some(anchor));
        };
        if !arrived_before(&oldest, &anchor) {
            return Ok(Some(anchor));
        }

        let claimed_at = anchor.updated_at;
        let displaced = anchor.correlation_id.0.clone();
        let requeued = self.engine.requeue(anchor, self.now());
        self.inbound.save_if_unchanged(&requeued, InboundStatus::Processing, claimed_at).await?;

        let now = self.now();
        if !self.engine.is_claimable(&oldest, now) {
            info!(
                event_name = "ingress.deferred",
                correlation_id = %displaced,
                waiting_on = %oldest.correlation_id.0,
                conversation_key = %oldest.conversation_key,
                "older message still pending; event deferred"
            );
            return Ok(None);
        }

        let (expected_status, expected_updated_at) = (oldest.status, oldest.updated_at);
        let claimed = self.engine.claim(oldest, worker_id, now)?;
        if !self.inbound.save_if_unchanged(&claimed, expected_status, expected_updated_at).await? {
            return Ok(None);
        }
        debug!(
            event_name = "ingress.reanchored",
            correlation_id = %claimed.correlation_id.0,
            displaced = %displaced,
            "older message of the conversation goes first"
        );
        Ok(Some(claimed))
    }

    /// Waits out the anchor's coalescing window, then claims the pending
    /// events of the same conversation that arrived inside it.
    async fn gather_batch(
        &self,
        anchor: InboundEventRecord,
        worker_id: &str,
    ) -> Result<Vec<InboundEventRecord>, PipelineError> {
        let window_end = anchor.received_at + self.engine.coalesce_window();
        if let Ok(remaining) = (window_end - self.now()).to_std() {
            if !remaining.is_zero() {
                tokio::time::sleep(remaining).await;
            }
        }

        let candidates = self
            .inbound
            .list_pending_for_conversation(&anchor.conversation_key, anchor.received_at, window_end)
            .await?;
        let selected = self.engine.select_batch(&anchor, &candidates);
        let batch_id = BatchId(Uuid::new_v4().to_string());
        let assigned = self.engine.assign_batch(selected.clone(), &batch_id, worker_id, self.now());

        let mut batch = Vec::with_capacity(assigned.len());
        for (before, after) in selected.iter().zip(assigned) {
            if self.inbound.save_if_unchanged(&after, before.status, before.updated_at).await? {
                batch.push(after);
            } else if batch.is_empty() {
                // The anchor itself moved underneath us.
                return Ok(Vec::new());
            }
        }

        if batch.len() > 1 {
            debug!(
                event_name = "ingress.coalesced",
                batch_id = %batch_id.0,
                correlation_id = %batch[0].correlation_id.0,
                batch_size = batch.len(),
                "messages coalesced into one turn"
            );
        }
        Ok(batch)
    }

    async fn complete_all(&self, batch: Vec<InboundEventRecord>) -> Result<(), PipelineError> {
        let now = self.now();
        for record in batch {
            let completed = self.engine.complete(record, now)?;
            self.inbound.save(&completed).await?;
        }
        Ok(())
    }

    /// Lease loss: back to pending without spending a retry.
    async fn requeue_all(&self, batch: Vec<InboundEventRecord>) -> Result<(), PipelineError> {
        let now = self.now();
        for record in batch {
            let (expected_status, expected_updated_at) = (record.status, record.updated_at);
            let requeued = self.engine.requeue(record, now);
            self.inbound.save_if_unchanged(&requeued, expected_status, expected_updated_at).await?;
        }
        Ok(())
    }

    /// Returns how many records of the batch were dead-lettered.
    async fn fail_all(
        &self,
        batch: Vec<InboundEventRecord>,
        error: &str,
    ) -> Result<usize, PipelineError> {
        let now = self.now();
        let mut dead_lettered = 0;
        for record in batch {
            let outcome = self.engine.fail(record, error, RetryPolicy::Retry, now)?;
            self.inbound.save(&outcome.record).await?;
            if outcome.dead_lettered {
                dead_lettered += 1;
                let record = &outcome.record;
                self.dead_letters
                    .insert(&DeadLetterRecord {
                        correlation_id: record.correlation_id.clone(),
                        conversation_key: record.conversation_key.clone(),
                        payload: record.payload.clone(),
                        retry_count: record.retry_count,
                        last_error: error.to_string(),
                        dead_lettered_at: now,
                    })
                    .await?;
                warn!(
                    event_name = "ingress.dead_lettered",
                    correlation_id = %record.correlation_id.0,
                    conversation_key = %record.conversation_key,
                    retry_count = record.retry_count,
                    "inbound event moved to dead-letter queue"
                );
            }
        }
        Ok(dead_lettered)
    }

    /// Turns automation off for the conversation, parks the session in
    /// HANDOFF and tells the customer. Failures here are logged only.
    async fn force_handoff(
        &self,
        conversation: &mut ConversationRecord,
        reason: &str,
        correlation_id: &str,
    ) {
        conversation.automation_enabled = false;
        conversation.handoff_reason = Some(reason.to_string());

        if let Err(error) = self.park_session(conversation).await {
            warn!(
                event_name = "ingress.handoff_session_failed",
                session_id = %conversation.session_id.0,
                error = %error,
                "could not move session to handoff"
            );
        }

        warn!(
            event_name = "ingress.handoff_forced",
            correlation_id,
            conversation_key = %conversation.conversation_key,
            reason,
            "conversation handed to a human"
        );
        let reply = OutboundReply::text(HANDOFF_REPLY);
        self.deliver(&conversation.conversation_key, &reply, correlation_id).await;
    }

    async fn park_session(&self, conversation: &ConversationRecord) -> Result<(), PipelineError> {
        let sessions = self.orchestrator.sessions();
        let workspace = WorkspaceId(conversation.conversation_key.workspace_id.clone());
        let mut memory = sessions
            .get_or_init(&conversation.session_id, &workspace, conversation.customer_id.as_ref())
            .await?;
        if memory.transition(ConversationState::Handoff) {
            sessions.save(&mut memory).await?;
        }
        Ok(())
    }

    /// Delivery is not retried: the turn already ran its tools.
    async fn deliver(&self, key: &ConversationKey, reply: &OutboundReply, correlation_id: &str) {
        if let Err(error) = self.outbound.deliver(key, reply, correlation_id).await {
            warn!(
                event_name = "egress.delivery_failed",
                conversation_key = %key,
                correlation_id,
                error = %error,
                "reply could not be delivered"
            );
        }
    }
}

/// The per-conversation lock row seen as a turn lease. Renewal pushes the
/// expiry one TTL past the current instant.
struct ConversationLease {
    locks: Arc<dyn ConversationLockRepository>,
    orchestrator: Arc<Orchestrator>,
    key: ConversationKey,
    owner: String,
    ttl: Duration,
}

#[async_trait]
impl TurnLease for ConversationLease {
    async fn renew(&self) -> bool {
        let expires_at = self.orchestrator.sessions().now() + self.ttl;
        match self.locks.renew(&self.key, &self.owner, expires_at).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    event_name = "ingress.lease_lost",
                    conversation_key = %self.key,
                    owner = %self.owner,
                    "conversation lock was taken over"
                );
                false
            }
            Err(error) => {
                warn!(
                    event_name = "ingress.lease_renew_failed",
                    conversation_key = %self.key,
                    owner = %self.owner,
                    error = %error,
                    "could not renew conversation lock"
                );
                false
            }
        }
    }
}

fn arrived_before(left: &InboundEventRecord, right: &InboundEventRecord) -> bool {
    (left.received_at, &left.correlation_id.0) < (right.received_at, &right.correlation_id.0)
}

fn customer_of(record: &InboundEventRecord) -> Option<CustomerId> {
    serde_json::from_value::<InboundEnvelope>(record.payload.clone())
        .ok()
        .and_then(|envelope| envelope.customer())
}
