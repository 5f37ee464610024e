//! Operator access to dead-lettered events and handed-off conversations.

use tracing::info;

use parley_core::domain::conversation::{ConversationRecord, DeadLetterRecord};
use parley_core::domain::inbound::{ConversationKey, CorrelationId, InboundStatus};

use crate::events::InboundEnvelope;
use crate::pipeline::{IngestionPipeline, PipelineError};

impl IngestionPipeline {
    pub async fn dead_lettered(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, PipelineError> {
        Ok(self.dead_letters().list(limit).await?)
    }

    /// Moves a dead-lettered event back to pending with a fresh retry budget.
    /// Returns `false` when the id is not in the dead-letter queue.
    pub async fn requeue_dead_letter(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<bool, PipelineError> {
        let Some(entry) = self.dead_letters().take(correlation_id).await? else {
            return Ok(false);
        };
        let now = self.now();

        let record = match self.inbound().find(correlation_id).await? {
            Some(mut record) => {
                record.status = InboundStatus::Pending;
                record.retry_count = 0;
                record.available_at = now;
                record.claimed_by = None;
                record.claimed_at = None;
                record.batch_id = None;
                record.last_error = None;
                record.updated_at = now;
                self.inbound().save(&record).await?;
                record
            }
            None => {
                let text = serde_json::from_value::<InboundEnvelope>(entry.payload.clone())
                    .ok()
                    .and_then(|envelope| envelope.payload.extract_text())
                    .unwrap_or_default();
                let record = self.engine().record(
                    entry.correlation_id.clone(),
                    entry.conversation_key.clone(),
                    entry.payload.clone(),
                    text,
                    now,
                );
                self.inbound().insert_if_absent(&record).await?;
                record
            }
        };

        info!(
            event_name = "ingress.dead_letter_requeued",
            correlation_id = %correlation_id.0,
            conversation_key = %record.conversation_key,
            previous_error = %entry.last_error,
            "dead-lettered event requeued"
        );
        Ok(true)
    }

    pub async fn handoffs(&self) -> Result<Vec<ConversationRecord>, PipelineError> {
        Ok(self.conversations().list_handoffs().await?)
    }

    /// Gives the conversation back to the agent: automation on, failure count
    /// cleared and the session returned to IDLE. Returns `false` when the
    /// conversation was not in handoff.
    pub async fn release_handoff(&self, key: &ConversationKey) -> Result<bool, PipelineError> {
        let Some(mut conversation) = self.conversations().find(key).await? else {
            return Ok(false);
        };
        if !conversation.in_handoff() {
            return Ok(false);
        }

        conversation.automation_enabled = true;
        conversation.consecutive_failures = 0;
        let reason = conversation.handoff_reason.take().unwrap_or_default();
        conversation.updated_at = self.now();
        self.conversations().save(&conversation).await?;
        let session_released = self.sessions().release_handoff(&conversation.session_id).await?;

        info!(
            event_name = "ingress.handoff_released",
            conversation_key = %key,
            session_released,
            reason = %reason,
            "conversation returned to the agent"
        );
        Ok(true)
    }
}
