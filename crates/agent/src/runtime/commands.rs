use serde_json::{json, Value};

use parley_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use parley_core::domain::confirmation::ConfirmationReply;
use parley_core::domain::reply::{ListItem, OutboundReply, QuickReply};
use parley_core::domain::session::{ActiveSubflow, OrderSummary, PaymentStage};
use parley_core::flows::ConversationState;
use parley_core::parse_reply;
use parley_core::text::normalize;

use super::collect::pick_index;
use super::{apply_transition, Orchestrator, Turn, TurnError, HANDOFF_REPLY};
use crate::background::EnrichmentJob;
use crate::tools::cart_json;

const CANCEL_WORDS: &[&str] = &["cancel", "cancelar", "cancela", "cancele"];
const ORDER_WORDS: &[&str] = &["order", "orders", "pedido", "pedidos", "orden", "ordenes"];

const PAYMENT_METHODS: &[(&str, &str)] = &[
    ("pix", "pix"),
    ("card", "card"),
    ("credit", "card"),
    ("debit", "card"),
    ("cartao", "card"),
    ("credito", "card"),
    ("debito", "card"),
    ("tarjeta", "card"),
    ("cash", "cash"),
    ("dinheiro", "cash"),
    ("efectivo", "cash"),
];

impl Orchestrator {
    /// A stored proposal consumes the turn: yes executes it once, no drops
    /// it, anything else repeats the question. Expired proposals are cleared
    /// and the message is routed normally.
    pub(super) async fn resolve_pending(
        &self,
        turn: &mut Turn,
    ) -> Result<Option<OutboundReply>, TurnError> {
        let Some(pending) = turn.memory.pending_confirmation.clone() else {
            return Ok(None);
        };

        if pending.is_expired(turn.now) {
            turn.memory.pending_confirmation = None;
            if turn.memory.state == ConversationState::AwaitingConfirmation
                && !turn.memory.has_items()
            {
                apply_transition(&mut turn.memory, ConversationState::Idle);
            }
            self.audit.emit(
                AuditEvent::from_context(
                    &turn.audit,
                    "confirmation.expired",
                    AuditCategory::Confirmation,
                    AuditOutcome::Rejected,
                )
                .with_metadata("tool_name", pending.tool_name.clone()),
            );
            return Ok(None);
        }

        let label = pending.tool_name.replace('_', " ");
        match parse_reply(&turn.input.text) {
            ConfirmationReply::Unclear => Ok(Some(OutboundReply::confirm_cancel(pending.message))),
            ConfirmationReply::No => {
                turn.memory.pending_confirmation = None;
                let back_to = if turn.memory.has_items() {
                    ConversationState::CollectingOrder
                } else {
                    ConversationState::Idle
                };
                apply_transition(&mut turn.memory, back_to);
                self.audit.emit(
                    AuditEvent::from_context(
                        &turn.audit,
                        "confirmation.declined",
                        AuditCategory::Confirmation,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("tool_name", pending.tool_name.clone()),
                );
                let reply = format!("Okay, I won't {label}. Nothing was changed.");
                Ok(Some(OutboundReply::text(reply)))
            }
            ConfirmationReply::Yes => {
                self.hold_lease(turn, "confirmed action").await?;
                turn.memory.pending_confirmation = None;
                turn.memory.transition_via(
                    ConversationState::AwaitingConfirmation,
                    ConversationState::Executing,
                );
                self.sessions.save(&mut turn.memory).await?;
                self.audit.emit(
                    AuditEvent::from_context(
                        &turn.audit,
                        "confirmation.confirmed",
                        AuditCategory::Confirmation,
                        AuditOutcome::Success,
                    )
                    .with_metadata("tool_name", pending.tool_name.clone()),
                );

                let input = pending.tool_input.clone();
                let reply = match self.run_tool(turn, &pending.tool_name, input).await {
                    Ok(outcome) if outcome.success => {
                        if turn.memory.state == ConversationState::Executing {
                            apply_transition(&mut turn.memory, ConversationState::Done);
                        }
                        let message = outcome
                            .data_str("message")
                            .map(str::to_owned)
                            .unwrap_or_else(|| format!("Done: {label}."));
                        OutboundReply::text(message)
                    }
                    Ok(outcome) => {
                        if turn.memory.state == ConversationState::Executing {
                            apply_transition(&mut turn.memory, ConversationState::Idle);
                        }
                        OutboundReply::text(outcome.user_message())
                    }
                    Err(error) => {
                        let reason = format!("{} failed: {error}", pending.tool_name);
                        self.escalate(turn, &reason)
                    }
                };
                Ok(Some(reply))
            }
        }
    }

    pub(super) async fn handle_subflow(
        &self,
        turn: &mut Turn,
        subflow: ActiveSubflow,
    ) -> Result<Option<OutboundReply>, TurnError> {
        Ok(match subflow {
            ActiveSubflow::ProductSelection { request, options, remaining, errors, shortages } => {
                self.handle_product_selection(turn, request, options, remaining, errors, shortages)
                    .await
            }
            ActiveSubflow::OrderSelection { tool_name, options } => {
                self.handle_order_selection(turn, &tool_name, &options)
            }
            ActiveSubflow::ShortageResolution { shortage } => {
                self.handle_shortage(turn, shortage).await
            }
            ActiveSubflow::Payment { order_id, stage } => {
                self.handle_payment(turn, order_id, stage).await?
            }
        })
    }

    /// Cart review answer: yes places the order once, no reopens the cart.
    pub(super) async fn handle_checkout(
        &self,
        turn: &mut Turn,
    ) -> Result<Option<OutboundReply>, TurnError> {
        match parse_reply(&turn.input.text) {
            ConfirmationReply::Unclear => Ok(None),
            ConfirmationReply::No => {
                apply_transition(&mut turn.memory, ConversationState::CollectingOrder);
                self.emit(turn, "checkout.declined", AuditCategory::Flow, AuditOutcome::Rejected);
                Ok(Some(OutboundReply::text("No problem. What would you like to change?")))
            }
            ConfirmationReply::Yes => {
                let editing = turn.memory.context.editing_order.clone();
                let tool_name = if editing.is_some() { "update_order" } else { "create_order" };
                let mut input = cart_json(&turn.memory.cart());
                input["customer_id"] =
                    json!(turn.memory.customer_id.as_ref().map(|customer| customer.0.clone()));
                if let Some(order_id) = &editing {
                    input["order_id"] = json!(order_id);
                }

                self.hold_lease(turn, "order placement").await?;
                apply_transition(&mut turn.memory, ConversationState::Executing);
                self.sessions.save(&mut turn.memory).await?;

                let outcome = match self.run_tool(turn, tool_name, input.clone()).await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        let reason = format!("{tool_name} failed: {error}");
                        return Ok(Some(self.escalate(turn, &reason)));
                    }
                };
                if !outcome.success {
                    apply_transition(&mut turn.memory, ConversationState::Idle);
                    self.emit(turn, "order.rejected", AuditCategory::Tooling, AuditOutcome::Failed);
                    return Ok(Some(OutboundReply::text(format!(
                        "{} Your cart is still saved.",
                        outcome.user_message()
                    ))));
                }

                let order_id = outcome
                    .data_str("order_id")
                    .map(str::to_owned)
                    .or(editing.clone())
                    .unwrap_or_else(|| "(pending)".to_string());
                let total = turn.memory.cart().total.round_dp(2);
                apply_transition(&mut turn.memory, ConversationState::Done);
                turn.memory.cart = None;
                turn.memory.context.editing_order = None;
                self.audit.emit(
                    AuditEvent::from_context(
                        &turn.audit,
                        "order.placed",
                        AuditCategory::Tooling,
                        AuditOutcome::Success,
                    )
                    .with_metadata("order_id", order_id.clone())
                    .with_metadata("tool_name", tool_name),
                );
                self.spawn_enrichment(turn, &order_id, input);

                let verb = if editing.is_some() { "updated" } else { "confirmed" };
                let body = format!("Order {order_id} {verb}. Total: {total}.");
                let payment_required = outcome
                    .data
                    .as_ref()
                    .and_then(|data| data.get("payment_required"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if payment_required {
                    turn.memory.context.subflow = Some(ActiveSubflow::Payment {
                        order_id,
                        stage: PaymentStage::ChoosingMethod,
                    });
                    return Ok(Some(payment_method_prompt(&body)));
                }
                Ok(Some(OutboundReply::text(body)))
            }
        }
    }

    /// "cancel order ORD-7": looks the order up and proposes the cancel
    /// through the confirmation gate.
    pub(super) async fn handle_order_command(
        &self,
        turn: &mut Turn,
    ) -> Result<Option<OutboundReply>, TurnError> {
        let normalized = normalize(&turn.input.text);
        let tokens: Vec<&str> = normalized.split(' ').collect();
        let is_cancel = tokens.iter().any(|token| CANCEL_WORDS.contains(token))
            && tokens.iter().any(|token| ORDER_WORDS.contains(token));
        if !is_cancel || !self.tools.contains("list_orders") || !self.tools.contains("cancel_order")
        {
            return Ok(None);
        }

        let reference = order_reference(&turn.input.text);
        let customer_id = turn.memory.customer_id.as_ref().map(|customer| customer.0.clone());
        let input = json!({ "customer_id": customer_id, "reference": reference });
        let outcome = match self.run_tool(turn, "list_orders", input).await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => return Ok(Some(OutboundReply::text(outcome.user_message()))),
            Err(_) => {
                return Ok(Some(OutboundReply::text(
                    "I couldn't look up your orders right now. Please try again shortly.",
                )))
            }
        };

        let orders = parse_orders(outcome.data.as_ref());
        let matching: Vec<OrderSummary> = match &reference {
            Some(reference) => {
                orders.into_iter().filter(|order| reference_matches(order, reference)).collect()
            }
            None => orders,
        };

        Ok(Some(match matching.as_slice() {
            [] => match &reference {
                Some(reference) => OutboundReply::text(format!(
                    "I couldn't find an open order matching {reference}."
                )),
                None => OutboundReply::text("You don't have any open orders."),
            },
            [order] => self.propose(turn, "cancel_order", json!({ "order_id": order.order_id })),
            many => {
                let items = many
                    .iter()
                    .map(|order| ListItem {
                        id: order.order_id.clone(),
                        title: order.label.clone(),
                        description: None,
                    })
                    .collect();
                turn.memory.context.subflow = Some(ActiveSubflow::OrderSelection {
                    tool_name: "cancel_order".to_string(),
                    options: matching.clone(),
                });
                OutboundReply::list("Which order should I cancel?", "Orders", items)
            }
        }))
    }

    fn handle_order_selection(
        &self,
        turn: &mut Turn,
        tool_name: &str,
        options: &[OrderSummary],
    ) -> Option<OutboundReply> {
        let ids: Vec<String> = options.iter().map(|order| order.order_id.clone()).collect();
        let selected = pick_index(&turn.input.text, &ids).or_else(|| {
            let reference = order_reference(&turn.input.text)?;
            options.iter().position(|order| reference_matches(order, &reference))
        })?;
        let input = json!({ "order_id": options[selected].order_id });
        Some(self.propose(turn, tool_name, input))
    }

    async fn handle_payment(
        &self,
        turn: &mut Turn,
        order_id: String,
        stage: PaymentStage,
    ) -> Result<Option<OutboundReply>, TurnError> {
        match stage {
            PaymentStage::ChoosingMethod => {
                let Some(method) = payment_method(&turn.input.text) else {
                    return Ok(None);
                };
                if self.tools.contains("set_payment_method") {
                    let input = json!({ "order_id": order_id, "method": method });
                    let failure = match self.run_tool(turn, "set_payment_method", input).await {
                        Ok(outcome) if outcome.success => None,
                        Ok(outcome) => Some(outcome.user_message()),
                        Err(_) => Some("I couldn't save the payment method.".to_string()),
                    };
                    if let Some(message) = failure {
                        turn.memory.context.subflow =
                            Some(ActiveSubflow::Payment { order_id, stage });
                        return Ok(Some(payment_method_prompt(&message)));
                    }
                }
                if method == "pix" {
                    turn.memory.context.subflow = Some(ActiveSubflow::Payment {
                        order_id: order_id.clone(),
                        stage: PaymentStage::AwaitingProof,
                    });
                    return Ok(Some(OutboundReply::text(format!(
                        "Great, please pay order {order_id} with Pix and send the receipt here."
                    ))));
                }
                Ok(Some(OutboundReply::text(format!(
                    "Thanks! Payment by {method} noted for order {order_id}."
                ))))
            }
            PaymentStage::AwaitingProof => {
                if !turn.input.text.contains("[attachment:") {
                    return Ok(None);
                }
                if self.tools.contains("submit_payment_proof") {
                    let input = json!({ "order_id": order_id, "proof": turn.input.text });
                    let failure = match self.run_tool(turn, "submit_payment_proof", input).await {
                        Ok(outcome) if outcome.success => None,
                        Ok(outcome) => Some(outcome.user_message()),
                        Err(_) => Some("I couldn't read that receipt.".to_string()),
                    };
                    if let Some(message) = failure {
                        turn.memory.context.subflow =
                            Some(ActiveSubflow::Payment { order_id, stage });
                        return Ok(Some(OutboundReply::text(format!(
                            "{message} Please send it again."
                        ))));
                    }
                }
                Ok(Some(OutboundReply::text(format!(
                    "Thanks! We received the payment receipt for order {order_id}."
                ))))
            }
        }
    }

    /// Stores a proposal for `tool_name` and asks the customer to confirm it.
    pub(super) fn propose(&self, turn: &mut Turn, tool_name: &str, input: Value) -> OutboundReply {
        let pending = self.gate.build_request(tool_name, &input, turn.now);
        let message = pending.message.clone();
        turn.memory.pending_confirmation = Some(pending);
        apply_transition(&mut turn.memory, ConversationState::AwaitingConfirmation);
        self.audit.emit(
            AuditEvent::from_context(
                &turn.audit,
                "confirmation.proposed",
                AuditCategory::Confirmation,
                AuditOutcome::Success,
            )
            .with_metadata("tool_name", tool_name),
        );
        OutboundReply::confirm_cancel(message)
    }

    /// Hands the conversation to a person. Used when a committed action
    /// failed in a way that leaves its effect unknown.
    pub(super) fn escalate(&self, turn: &mut Turn, reason: &str) -> OutboundReply {
        apply_transition(&mut turn.memory, ConversationState::Handoff);
        tracing::warn!(
            event_name = "turn.escalated",
            session_id = %turn.input.session_id.0,
            correlation_id = %turn.input.correlation_id,
            reason,
            "handing conversation to a person"
        );
        self.audit.emit(
            AuditEvent::from_context(
                &turn.audit,
                "handoff.forced",
                AuditCategory::Handoff,
                AuditOutcome::Failed,
            )
            .with_metadata("reason", reason),
        );
        OutboundReply::text(HANDOFF_REPLY)
    }

    fn spawn_enrichment(&self, turn: &Turn, order_id: &str, mut order: Value) {
        let Some(enrichment) = &self.enrichment else {
            return;
        };
        order["order_id"] = json!(order_id);
        enrichment.spawn(EnrichmentJob {
            session_id: turn.memory.session_id.clone(),
            workspace_id: turn.memory.workspace_id.clone(),
            customer_id: turn.memory.customer_id.clone(),
            correlation_id: turn.input.correlation_id.clone(),
            order,
        });
    }
}

/// First token that carries a digit, e.g. `ORD-7` or `#1042`.
fn order_reference(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|ch: char| !ch.is_alphanumeric() && ch != '-'))
        .find(|token| token.chars().any(|ch| ch.is_ascii_digit()))
        .map(str::to_owned)
}

fn reference_matches(order: &OrderSummary, reference: &str) -> bool {
    let order_id = normalize(&order.order_id);
    let reference = normalize(reference);
    !reference.is_empty()
        && (order_id == reference || order_id.ends_with(&format!(" {reference}")))
}

/// Reads `{"orders": [{"order_id", "label"?}]}` from `list_orders`.
fn parse_orders(data: Option<&Value>) -> Vec<OrderSummary> {
    data.and_then(|data| data.get("orders"))
        .and_then(Value::as_array)
        .map(|orders| {
            orders
                .iter()
                .filter_map(|order| {
                    let order_id = order.get("order_id")?.as_str()?.to_string();
                    let label = order
                        .get("label")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .unwrap_or_else(|| order_id.clone());
                    Some(OrderSummary { order_id, label })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn payment_method(text: &str) -> Option<&'static str> {
    let normalized = normalize(text);
    normalized.split(' ').find_map(|token| {
        PAYMENT_METHODS.iter().find(|(word, _)| *word == token).map(|(_, method)| *method)
    })
}

fn payment_method_prompt(body: &str) -> OutboundReply {
    OutboundReply::quick_replies(
        format!("{body}\nHow would you like to pay?"),
        vec![
            QuickReply { id: "pix".to_string(), title: "Pix".to_string() },
            QuickReply { id: "card".to_string(), title: "Card".to_string() },
            QuickReply { id: "cash".to_string(), title: "Cash".to_string() },
        ],
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{order_reference, parse_orders, payment_method, reference_matches};
    use parley_core::domain::session::OrderSummary;

    #[test]
    fn order_reference_picks_the_token_with_digits() {
        assert_eq!(order_reference("cancel order ORD-7 please"), Some("ORD-7".to_string()));
        assert_eq!(order_reference("cancelar pedido #1042!"), Some("1042".to_string()));
        assert_eq!(order_reference("cancel my order"), None);
    }

    #[test]
    fn reference_matches_full_id_or_numeric_suffix() {
        let order = OrderSummary { order_id: "ORD-7".to_string(), label: "ORD-7".to_string() };
        assert!(reference_matches(&order, "ord-7"));
        assert!(reference_matches(&order, "7"));
        assert!(!reference_matches(&order, "17"));
    }

    #[test]
    fn orders_payload_is_parsed_leniently() {
        let orders = parse_orders(Some(&json!({
            "orders": [
                {"order_id": "ORD-7", "label": "ORD-7 (2 items)"},
                {"order_id": "ORD-8"},
                {"label": "missing id"}
            ]
        })));
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].label, "ORD-8");
        assert!(parse_orders(None).is_empty());
    }

    #[test]
    fn payment_method_synonyms() {
        assert_eq!(payment_method("Pix"), Some("pix"));
        assert_eq!(payment_method("cartão de crédito"), Some("card"));
        assert_eq!(payment_method("dinheiro"), Some("cash"));
        assert_eq!(payment_method("later"), None);
    }
}
