use serde_json::{json, Value};
use tera::{Context, Tera};

use parley_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use parley_core::domain::catalog::ProductCandidate;
use parley_core::domain::message::{trim_history, ContentBlock, MessageRole};
use parley_core::domain::reply::OutboundReply;
use parley_core::domain::session::{ConversationMode, StockShortage};
use parley_core::flows::ConversationState;

use super::collect::{option_id, shortage_from};
use super::{
    Orchestrator, Routed, Turn, TurnError, APOLOGY_REPLY, ITERATION_FALLBACK_REPLY, OFFLINE_REPLY,
};
use crate::guardrails::{GuardrailDecision, ToolRequest};
use crate::llm::{ReasoningError, ReasoningMessage, ReasoningRequest, StopReason};

const CATALOG_PROMPT_LIMIT: usize = 50;

const SYSTEM_PROMPT: &str = r#"You are the ordering assistant for store {{ workspace }}.
Conversation state: {{ state }}. Mode: {{ mode }}.
{% if editing_order %}The customer is changing order {{ editing_order }}.
{% endif %}Prices, stock and totals come only from the catalog and tool results. Never invent them.
Add items with add_to_cart using catalog ids.
Call review_cart once the customer has finished ordering.
Keep replies short and in the customer's language.
{% if cart %}Current cart:
{{ cart }}
{% else %}The cart is empty.
{% endif %}Catalog:
{% for line in catalog %}- {{ line }}
{% endfor %}"#;

impl Orchestrator {
    /// Bounded reason/act loop over the tools allowed in the turn's mode.
    pub(super) async fn reasoning_loop(
        &self,
        turn: &mut Turn,
        mode_override: Option<ConversationMode>,
    ) -> Result<Routed, TurnError> {
        let mode = mode_override.unwrap_or_else(|| turn.memory.context.mode());
        let tools = self.tools.definitions(mode);
        let mut messages = self.history(turn).await?;
        let mut shortages: Vec<StockShortage> = Vec::new();

        for step in 1..=self.settings.max_iterations {
            if step > 1 {
                self.hold_lease(turn, "reasoning step").await?;
            }
            let request = ReasoningRequest {
                system: self.system_prompt(turn, mode),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.settings.max_tokens,
            };
            let call = self.reasoning.complete(request);
            let response = match tokio::time::timeout(self.settings.reasoning_timeout, call).await {
                Err(_) | Ok(Err(ReasoningError::Timeout)) => {
                    tracing::warn!(
                        event_name = "reasoning.timeout",
                        session_id = %turn.input.session_id.0,
                        correlation_id = %turn.input.correlation_id,
                        step,
                        "reasoning call timed out"
                    );
                    return Ok(Routed::Discard(OutboundReply::text(APOLOGY_REPLY)));
                }
                Ok(Err(ReasoningError::Disabled)) => {
                    return Ok(Routed::Reply(OutboundReply::text(OFFLINE_REPLY)));
                }
                Ok(Err(error)) if error.is_transient() => {
                    tracing::warn!(
                        event_name = "reasoning.failed",
                        session_id = %turn.input.session_id.0,
                        correlation_id = %turn.input.correlation_id,
                        step,
                        error = %error,
                        "reasoning call failed"
                    );
                    return Ok(Routed::Discard(OutboundReply::text(APOLOGY_REPLY)));
                }
                Ok(Err(error)) => return Err(error.into()),
                Ok(Ok(response)) => response,
            };
            turn.tokens_used = turn.tokens_used.saturating_add(response.usage.total());

            let calls: Vec<(String, String, Value)> = response
                .tool_uses()
                .map(|(id, name, input)| (id.to_owned(), name.to_owned(), input.clone()))
                .collect();
            if calls.is_empty() {
                let reply = self.final_reply(turn, response.joined_text(), shortages);
                return Ok(Routed::Reply(reply));
            }

            let correlation_id = turn.input.correlation_id.clone();
            self.stage_message(
                turn,
                format!("{correlation_id}:step{step}:call"),
                MessageRole::Assistant,
                response.content.clone(),
            );
            messages.push(ReasoningMessage {
                role: MessageRole::Assistant,
                content: response.content.clone(),
            });

            let mut results = Vec::with_capacity(calls.len());
            let mut proposal = None;
            for (id, name, input) in calls {
                if proposal.is_some() {
                    results.push(tool_result(id, "skipped: waiting for confirmation", true));
                    continue;
                }
                let decision = self
                    .guardrails
                    .evaluate(&ToolRequest { name: &name, input: &input, mode }, &self.tools);
                match decision {
                    GuardrailDecision::Deny { reason_code, user_message } => {
                        self.audit.emit(
                            AuditEvent::from_context(
                                &turn.audit,
                                "guardrail.denied",
                                AuditCategory::Tooling,
                                AuditOutcome::Rejected,
                            )
                            .with_metadata("tool_name", name.clone())
                            .with_metadata("reason_code", reason_code),
                        );
                        let body = json!({
                            "success": false,
                            "code": reason_code,
                            "error": user_message
                        });
                        results.push(tool_result(id, body.to_string(), true));
                    }
                    GuardrailDecision::RequireConfirmation => {
                        proposal = Some(self.propose(turn, &name, input));
                        results.push(tool_result(id, "waiting for customer confirmation", false));
                    }
                    GuardrailDecision::Allow => match self.run_tool(turn, &name, input).await {
                        Ok(outcome) => {
                            if let Some(shortage) = shortage_from(&outcome) {
                                shortages.retain(|known| {
                                    known.product_id != shortage.product_id
                                        || known.variant_id != shortage.variant_id
                                });
                                shortages.push(shortage);
                            }
                            results.push(tool_result(
                                id,
                                outcome.to_result_content(),
                                !outcome.success,
                            ));
                        }
                        Err(error) => {
                            let body = json!({ "success": false, "error": error.to_string() });
                            results.push(tool_result(id, body.to_string(), true));
                        }
                    },
                }
            }

            self.stage_message(
                turn,
                format!("{correlation_id}:step{step}:result"),
                MessageRole::User,
                results.clone(),
            );
            if let Some(reply) = proposal {
                return Ok(Routed::Reply(reply));
            }
            messages.push(ReasoningMessage { role: MessageRole::User, content: results });

            if response.stop_reason == StopReason::EndTurn {
                let reply = self.final_reply(turn, response.joined_text(), shortages);
                return Ok(Routed::Reply(reply));
            }
        }

        tracing::warn!(
            event_name = "reasoning.iteration_cap",
            session_id = %turn.input.session_id.0,
            correlation_id = %turn.input.correlation_id,
            max_iterations = self.settings.max_iterations,
            "reasoning loop hit its iteration cap"
        );
        Ok(Routed::Reply(OutboundReply::text(ITERATION_FALLBACK_REPLY)))
    }

    async fn history(&self, turn: &Turn) -> Result<Vec<ReasoningMessage>, TurnError> {
        let since = turn.now - self.settings.history_max_age;
        let stored = self
            .messages
            .recent(&turn.input.session_id, since, self.settings.history_window)
            .await?;
        let history: Vec<ReasoningMessage> =
            trim_history(&stored, self.settings.history_window).iter().map(Into::into).collect();
        if history.is_empty() {
            return Ok(vec![ReasoningMessage::user_text(turn.input.text.clone())]);
        }
        Ok(history)
    }

    fn system_prompt(&self, turn: &Turn, mode: ConversationMode) -> String {
        let cart = turn.memory.has_items().then(|| turn.memory.cart().summary());
        let catalog: Vec<String> =
            turn.catalog.iter().take(CATALOG_PROMPT_LIMIT).map(catalog_line).collect();

        let mut context = Context::new();
        context.insert("workspace", &turn.input.workspace_id.0);
        context.insert("state", &turn.memory.state.to_string());
        context.insert("mode", mode.as_str());
        context.insert("editing_order", &turn.memory.context.editing_order);
        context.insert("cart", &cart);
        context.insert("catalog", &catalog);

        Tera::one_off(SYSTEM_PROMPT, &context, false).unwrap_or_else(|error| {
            tracing::warn!(
                event_name = "reasoning.prompt_render_failed",
                error = %error,
                "falling back to the plain system prompt"
            );
            format!(
                "You are the ordering assistant for store {}. Prices come only from the \
                 catalog and tool results.\nCatalog:\n{}",
                turn.input.workspace_id.0,
                catalog.join("\n")
            )
        })
    }

    /// Shapes the model's closing text: a shortage question, the cart review
    /// prompt, or plain text.
    fn final_reply(
        &self,
        turn: &mut Turn,
        text: String,
        shortages: Vec<StockShortage>,
    ) -> OutboundReply {
        let awaiting_review = turn.memory.pending_confirmation.is_none()
            && turn.memory.state == ConversationState::AwaitingConfirmation
            && turn.memory.has_items();

        let text = if text.trim().is_empty() {
            if turn.memory.has_items() {
                format!("Your order:\n{}", turn.memory.cart().summary())
            } else {
                "Okay.".to_string()
            }
        } else {
            text
        };

        let resolvable: Vec<StockShortage> =
            shortages.into_iter().filter(|shortage| shortage.available > 0).collect();
        if let [shortage] = resolvable.as_slice() {
            if turn.memory.pending_confirmation.is_none() && turn.memory.context.subflow.is_none()
            {
                return self.open_shortage_resolution(turn, vec![text], shortage.clone());
            }
        }

        if awaiting_review {
            return OutboundReply::confirm_cancel(text);
        }
        OutboundReply::text(text)
    }
}

fn tool_result(tool_use_id: String, content: impl Into<String>, is_error: bool) -> ContentBlock {
    ContentBlock::ToolResult { tool_use_id, content: content.into(), is_error }
}

fn catalog_line(candidate: &ProductCandidate) -> String {
    let mut line = format!("{}: {} ({})", option_id(candidate), candidate.name, candidate.price);
    if let Some(unit) = &candidate.secondary_unit {
        line.push_str(&format!(", {} of {}", unit.label, unit.size));
    }
    match candidate.stock {
        Some(stock) if stock <= 0 => line.push_str(", out of stock"),
        Some(stock) => line.push_str(&format!(", {stock} in stock")),
        None => {}
    }
    line
}
