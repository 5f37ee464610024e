//! Per-turn driver. A turn is routed over `(state, pending confirmation,
//! active sub-flow)` to a small handler; only messages no handler claims
//! reach the bounded reasoning loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use parley_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use parley_core::config::AppConfig;
use parley_core::domain::catalog::ProductCandidate;
use parley_core::domain::message::{ContentBlock, MessageRole, StoredMessage};
use parley_core::domain::reply::OutboundReply;
use parley_core::domain::session::{CustomerId, SessionId, SessionMemory, WorkspaceId};
use parley_core::flows::ConversationState;
use parley_core::{ConfirmationGate, ProductMatcher, TracingAuditSink};
use parley_db::repositories::{CatalogRepository, MessageRepository, RepositoryError};
use parley_db::{SessionStore, SessionStoreError};

use crate::background::BackgroundEnrichment;
use crate::guardrails::GuardrailPolicy;
use crate::llm::{ReasoningClient, ReasoningError};
use crate::tools::{ToolContext, ToolError, ToolOutcome, ToolRegistry};

mod collect;
mod commands;
mod reasoning;

pub const APOLOGY_REPLY: &str =
    "Sorry, I'm having trouble answering right now. Please try again in a moment.";
pub const ITERATION_FALLBACK_REPLY: &str = "Sorry, I couldn't finish that. \
    Could you rephrase, or tell me the items and quantities you want?";
pub const OFFLINE_REPLY: &str =
    "I can take orders like \"2 sodas, 1 water\". What would you like?";
pub const HANDOFF_REPLY: &str =
    "I'm passing this conversation to a member of our team. They'll get back to you shortly.";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Reasoning(#[from] ReasoningError),
    /// The caller no longer holds the conversation; nothing was committed.
    #[error("conversation lease lost before {checkpoint}")]
    LeaseLost { checkpoint: &'static str },
}

/// Exclusive hold on a conversation for the length of one turn. The
/// orchestrator renews it between reasoning iterations and before anything
/// is committed.
#[async_trait]
pub trait TurnLease: Send + Sync {
    /// `false` once another worker may own the conversation.
    async fn renew(&self) -> bool;
}

/// For callers that serialize turns some other way.
pub struct UnboundedLease;

#[async_trait]
impl TurnLease for UnboundedLease {
    async fn renew(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorSettings {
    pub max_iterations: u32,
    pub history_window: usize,
    pub history_max_age: Duration,
    pub reasoning_timeout: StdDuration,
    pub max_tokens: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            history_window: 20,
            history_max_age: Duration::hours(24),
            reasoning_timeout: StdDuration::from_secs(30),
            max_tokens: 1024,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            history_window: config.agent.history_window,
            history_max_age: i64::try_from(config.agent.history_max_age_hours)
                .ok()
                .and_then(Duration::try_hours)
                .unwrap_or_else(|| Duration::hours(24)),
            reasoning_timeout: StdDuration::from_secs(config.llm.timeout_secs),
            max_tokens: config.llm.max_tokens,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnInput {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub customer_id: Option<CustomerId>,
    /// Id of the inbound event (or anchor of a coalesced batch).
    pub correlation_id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    /// `None` when the conversation is with a human and the turn stays silent.
    pub reply: Option<OutboundReply>,
    pub new_state: ConversationState,
    pub tools_invoked: Vec<String>,
    pub tokens_used: u32,
}

impl TurnOutcome {
    pub fn is_handoff(&self) -> bool {
        self.new_state == ConversationState::Handoff
    }
}

/// Working set of one turn; the memory and the reasoning transcript are
/// saved together at the end.
pub(crate) struct Turn {
    input: TurnInput,
    memory: SessionMemory,
    started_in: ConversationState,
    staged: Vec<StoredMessage>,
    lease: Arc<dyn TurnLease>,
    catalog: Vec<ProductCandidate>,
    tools_invoked: Vec<String>,
    tokens_used: u32,
    audit: AuditContext,
    now: DateTime<Utc>,
}

impl Turn {
    fn outcome(self, reply: Option<OutboundReply>) -> TurnOutcome {
        TurnOutcome {
            reply,
            new_state: self.memory.state,
            tools_invoked: self.tools_invoked,
            tokens_used: self.tokens_used,
        }
    }
}

pub struct Orchestrator {
    sessions: SessionStore,
    messages: Arc<dyn MessageRepository>,
    catalog: Arc<dyn CatalogRepository>,
    reasoning: Arc<dyn ReasoningClient>,
    tools: Arc<ToolRegistry>,
    gate: ConfirmationGate,
    matcher: ProductMatcher,
    guardrails: GuardrailPolicy,
    audit: Arc<dyn AuditSink>,
    enrichment: Option<BackgroundEnrichment>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        sessions: SessionStore,
        messages: Arc<dyn MessageRepository>,
        catalog: Arc<dyn CatalogRepository>,
        reasoning: Arc<dyn ReasoningClient>,
        tools: Arc<ToolRegistry>,
        gate: ConfirmationGate,
    ) -> Self {
        Self {
            sessions,
            messages,
            catalog,
            reasoning,
            tools,
            gate,
            matcher: ProductMatcher::new(),
            guardrails: GuardrailPolicy::default(),
            audit: Arc::new(TracingAuditSink),
            enrichment: None,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_enrichment(mut self, enrichment: BackgroundEnrichment) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    pub fn with_matcher(mut self, matcher: ProductMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn process_turn(&self, input: TurnInput) -> Result<TurnOutcome, TurnError> {
        self.process_turn_with_lease(input, Arc::new(UnboundedLease)).await
    }

    pub async fn process_turn_with_lease(
        &self,
        input: TurnInput,
        lease: Arc<dyn TurnLease>,
    ) -> Result<TurnOutcome, TurnError> {
        let memory = self
            .sessions
            .get_or_init(&input.session_id, &input.workspace_id, input.customer_id.as_ref())
            .await?;
        let audit = AuditContext::new(
            Some(input.session_id.0.clone()),
            input.correlation_id.clone(),
            "orchestrator",
        );
        let mut turn = Turn {
            started_in: memory.state,
            memory,
            staged: Vec::new(),
            lease,
            catalog: Vec::new(),
            tools_invoked: Vec::new(),
            tokens_used: 0,
            audit,
            now: self.sessions.now(),
            input,
        };

        if turn.memory.is_handoff() {
            tracing::info!(
                event_name = "turn.silenced_by_handoff",
                session_id = %turn.input.session_id.0,
                correlation_id = %turn.input.correlation_id,
                "conversation is with a human, no automated reply"
            );
            return Ok(turn.outcome(None));
        }

        self.record_message(
            &turn,
            turn.input.correlation_id.clone(),
            MessageRole::User,
            vec![ContentBlock::text(turn.input.text.clone())],
        )
        .await?;

        if turn.memory.state == ConversationState::Executing {
            let reply = self.interrupted_execution(&mut turn);
            return self.finish(turn, reply).await;
        }

        turn.catalog = self.catalog.snapshot(&turn.input.workspace_id).await?;

        match self.route(&mut turn).await? {
            Routed::Reply(reply) => self.finish(turn, reply).await,
            Routed::Discard(reply) => self.discard(turn, reply).await,
        }
    }

    async fn route(&self, turn: &mut Turn) -> Result<Routed, TurnError> {
        if let Some(reply) = self.resolve_pending(turn).await? {
            return Ok(Routed::Reply(reply));
        }

        let mut mode_override = None;
        if let Some(subflow) = turn.memory.context.subflow.take() {
            let kind = subflow.kind();
            let mut forced = turn.memory.context.clone();
            forced.subflow = Some(subflow.clone());
            if let Some(reply) = self.handle_subflow(turn, subflow).await? {
                return Ok(Routed::Reply(reply));
            }
            tracing::debug!(
                event_name = "subflow.fell_through",
                subflow = kind,
                correlation_id = %turn.input.correlation_id,
                "sub-flow did not understand the reply"
            );
            mode_override = Some(forced.mode());
        } else if turn.memory.state == ConversationState::AwaitingConfirmation
            && turn.memory.has_items()
        {
            // A message naming an order is not an answer to the cart review.
            if let Some(reply) = self.handle_order_command(turn).await? {
                return Ok(Routed::Reply(reply));
            }
            if let Some(reply) = self.handle_checkout(turn).await? {
                return Ok(Routed::Reply(reply));
            }
        }

        if let Some(reply) = self.handle_order_command(turn).await? {
            return Ok(Routed::Reply(reply));
        }

        if turn.memory.state.accepts_order_items() {
            if let Some(requests) = crate::quick_parse::parse(&turn.input.text) {
                if let Some(reply) =
                    self.collect_items(turn, requests, Vec::new(), Vec::new(), 0, true).await
                {
                    return Ok(Routed::Reply(reply));
                }
            }
        }

        self.reasoning_loop(turn, mode_override).await
    }

    /// A turn found the conversation mid-execution: a previous worker died
    /// after committing to a risky call. Whether it ran is unknown, so a person
    /// takes over instead of retrying it.
    fn interrupted_execution(&self, turn: &mut Turn) -> OutboundReply {
        turn.memory.transition(ConversationState::Handoff);
        self.audit.emit(
            AuditEvent::from_context(
                &turn.audit,
                "turn.execution_interrupted",
                AuditCategory::Handoff,
                AuditOutcome::Failed,
            )
            .with_metadata("reason", "state was EXECUTING at turn start"),
        );
        OutboundReply::text(HANDOFF_REPLY)
    }

    async fn finish(&self, mut turn: Turn, reply: OutboundReply) -> Result<TurnOutcome, TurnError> {
        self.hold_lease(&turn, "commit").await?;
        self.sessions.save(&mut turn.memory).await?;
        for message in std::mem::take(&mut turn.staged) {
            self.messages.append(&message).await?;
        }
        self.record_message(
            &turn,
            format!("{}:reply", turn.input.correlation_id),
            MessageRole::Assistant,
            vec![ContentBlock::text(reply.body())],
        )
        .await?;

        tracing::info!(
            event_name = "turn.completed",
            session_id = %turn.input.session_id.0,
            correlation_id = %turn.input.correlation_id,
            state = %turn.memory.state,
            tools_invoked = turn.tools_invoked.len(),
            tokens_used = turn.tokens_used,
            "turn processed"
        );
        Ok(turn.outcome(Some(reply)))
    }

    /// Replies without committing the turn. The memory and the staged
    /// transcript are dropped together; only the reply is kept in history.
    async fn discard(&self, turn: Turn, reply: OutboundReply) -> Result<TurnOutcome, TurnError> {
        self.hold_lease(&turn, "reply").await?;
        self.record_message(
            &turn,
            format!("{}:reply", turn.input.correlation_id),
            MessageRole::Assistant,
            vec![ContentBlock::text(reply.body())],
        )
        .await?;

        tracing::info!(
            event_name = "turn.discarded",
            session_id = %turn.input.session_id.0,
            correlation_id = %turn.input.correlation_id,
            dropped_messages = turn.staged.len(),
            tools_invoked = turn.tools_invoked.len(),
            "turn replied without committing"
        );
        let new_state = turn.started_in;
        let mut outcome = turn.outcome(Some(reply));
        outcome.new_state = new_state;
        Ok(outcome)
    }

    async fn hold_lease(
        &self,
        turn: &Turn,
        checkpoint: &'static str,
    ) -> Result<(), TurnError> {
        if turn.lease.renew().await {
            return Ok(());
        }
        tracing::warn!(
            event_name = "turn.lease_lost",
            session_id = %turn.input.session_id.0,
            correlation_id = %turn.input.correlation_id,
            checkpoint,
            "conversation lease lost, abandoning turn"
        );
        Err(TurnError::LeaseLost { checkpoint })
    }

    /// Queues a reasoning transcript message; it is written with the memory.
    fn stage_message(
        &self,
        turn: &mut Turn,
        external_id: String,
        role: MessageRole,
        content: Vec<ContentBlock>,
    ) {
        let message = StoredMessage {
            session_id: turn.input.session_id.clone(),
            external_id,
            role,
            content,
            created_at: self.sessions.now(),
        };
        turn.staged.push(message);
    }

    async fn record_message(
        &self,
        turn: &Turn,
        external_id: String,
        role: MessageRole,
        content: Vec<ContentBlock>,
    ) -> Result<bool, TurnError> {
        let message = StoredMessage {
            session_id: turn.input.session_id.clone(),
            external_id,
            role,
            content,
            created_at: self.sessions.now(),
        };
        Ok(self.messages.append(&message).await?)
    }

    /// Executes a registered tool against the turn's memory and applies the
    /// state transition it asks for.
    async fn run_tool(
        &self,
        turn: &mut Turn,
        name: &str,
        input: Value,
    ) -> Result<ToolOutcome, ToolError> {
        turn.tools_invoked.push(name.to_string());
        let mut context = ToolContext {
            memory: &mut turn.memory,
            catalog: &turn.catalog,
            correlation_id: &turn.input.correlation_id,
        };
        let outcome = self.tools.execute(name, input, &mut context).await?;
        if let Some(state) = outcome.state_transition {
            apply_transition(&mut turn.memory, state);
        }
        Ok(outcome)
    }

    fn emit(&self, turn: &Turn, event_type: &str, category: AuditCategory, outcome: AuditOutcome) {
        self.audit.emit(AuditEvent::from_context(&turn.audit, event_type, category, outcome));
    }
}

enum Routed {
    /// Persist memory and reply.
    Reply(OutboundReply),
    /// Reply without committing this turn's memory changes.
    Discard(OutboundReply),
}

/// AWAITING_CONFIRMATION is reached through COLLECTING_ORDER when there is no
/// direct edge; rejected targets are logged and ignored.
pub(crate) fn apply_transition(memory: &mut SessionMemory, to: ConversationState) {
    let from = memory.state;
    let applied = match to {
        ConversationState::AwaitingConfirmation | ConversationState::NeedsDetails => {
            memory.transition_via(ConversationState::CollectingOrder, to)
        }
        _ => memory.transition(to),
    };
    if !applied {
        tracing::warn!(
            event_name = "flow.transition_rejected",
            session_id = %memory.session_id.0,
            from = %from,
            to = %to,
            "ignoring invalid state transition"
        );
    }
}

#[cfg(test)]
mod tests;
