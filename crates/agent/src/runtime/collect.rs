use serde_json::{json, Value};

use parley_core::domain::catalog::{ProductCandidate, ProductId, VariantId};
use parley_core::domain::confirmation::ConfirmationReply;
use parley_core::domain::reply::{ListItem, OutboundReply, QuickReply};
use parley_core::domain::session::{ActiveSubflow, ItemRequest, StockShortage};
use parley_core::flows::ConversationState;
use parley_core::matcher::MatchResult;
use parley_core::parse_reply;
use parley_core::text::normalize;

use super::{apply_transition, Orchestrator, Turn};
use crate::tools::ToolOutcome;

impl Orchestrator {
    /// Resolves each request against the catalog snapshot and adds the hits.
    /// Stops at the first ambiguous name and parks the rest in a
    /// `ProductSelection`. With `defer_when_unresolved`, returns `None` when
    /// nothing at all could be added so the reasoning loop can try.
    pub(super) async fn collect_items(
        &self,
        turn: &mut Turn,
        requests: Vec<ItemRequest>,
        mut errors: Vec<String>,
        mut shortages: Vec<StockShortage>,
        mut added: usize,
        defer_when_unresolved: bool,
    ) -> Option<OutboundReply> {
        for (index, request) in requests.iter().enumerate() {
            match self.matcher.resolve(&request.name, &turn.catalog) {
                MatchResult::Match { candidate } => {
                    let quantity =
                        candidate.base_quantity(request.quantity, request.secondary_unit);
                    if self
                        .add_line(turn, &candidate, quantity, &mut errors, &mut shortages)
                        .await
                    {
                        added += 1;
                    }
                }
                MatchResult::Ambiguous { options } => {
                    let reply = selection_reply(request, &options);
                    turn.memory.context.subflow = Some(ActiveSubflow::ProductSelection {
                        request: request.clone(),
                        options,
                        remaining: requests[index + 1..].to_vec(),
                        errors,
                        shortages,
                    });
                    apply_transition(&mut turn.memory, ConversationState::NeedsDetails);
                    return Some(reply);
                }
                MatchResult::NoMatch => {
                    errors.push(format!("I couldn't find \"{}\" in our catalog.", request.name));
                }
            }
        }

        if defer_when_unresolved && added == 0 && shortages.is_empty() {
            return None;
        }
        Some(self.finish_collection(turn, errors, shortages))
    }

    async fn add_line(
        &self,
        turn: &mut Turn,
        candidate: &ProductCandidate,
        quantity: u32,
        errors: &mut Vec<String>,
        shortages: &mut Vec<StockShortage>,
    ) -> bool {
        let input = line_input(&candidate.product_id, candidate.variant_id.as_ref(), quantity);
        match self.run_tool(turn, "add_to_cart", input).await {
            Ok(outcome) if outcome.success => true,
            Ok(outcome) => {
                match shortage_from(&outcome) {
                    Some(shortage) => shortages.push(shortage),
                    None => errors.push(outcome.user_message()),
                }
                false
            }
            Err(error) => {
                tracing::warn!(
                    event_name = "collect.add_failed",
                    correlation_id = %turn.input.correlation_id,
                    product_id = %candidate.product_id.0,
                    error = %error,
                    "add_to_cart failed during quick collection"
                );
                errors.push(format!("I couldn't add {} right now.", candidate.name));
                false
            }
        }
    }

    /// Closing reply of a collection pass: a shortage question when exactly
    /// one shortage can be partly met, otherwise the cart review.
    pub(super) fn finish_collection(
        &self,
        turn: &mut Turn,
        errors: Vec<String>,
        shortages: Vec<StockShortage>,
    ) -> OutboundReply {
        let mut lines = errors;
        let resolvable: Vec<&StockShortage> =
            shortages.iter().filter(|shortage| shortage.available > 0).collect();

        if let [shortage] = resolvable.as_slice() {
            let shortage = (*shortage).clone();
            lines.extend(
                shortages.iter().filter(|other| **other != shortage).map(shortage_line),
            );
            return self.open_shortage_resolution(turn, lines, shortage);
        }

        lines.extend(shortages.iter().map(shortage_line));
        if turn.memory.has_items() {
            apply_transition(&mut turn.memory, ConversationState::AwaitingConfirmation);
            lines.push(format!("Your order:\n{}", turn.memory.cart().summary()));
            lines.push("Shall I place it?".to_string());
            return OutboundReply::confirm_cancel(lines.join("\n"));
        }
        lines.push("What would you like to order?".to_string());
        OutboundReply::text(lines.join("\n"))
    }

    pub(super) fn open_shortage_resolution(
        &self,
        turn: &mut Turn,
        mut lines: Vec<String>,
        shortage: StockShortage,
    ) -> OutboundReply {
        lines.push(format!(
            "We only have {} of {} (you asked for {}). Add {} instead?",
            shortage.available, shortage.name, shortage.requested, shortage.available
        ));
        let add_label = format!("Add {}", shortage.available);
        turn.memory.context.subflow = Some(ActiveSubflow::ShortageResolution { shortage });
        OutboundReply::quick_replies(
            lines.join("\n"),
            vec![
                QuickReply { id: "yes".to_string(), title: add_label },
                QuickReply { id: "no".to_string(), title: "Skip".to_string() },
            ],
        )
    }

    pub(super) async fn handle_product_selection(
        &self,
        turn: &mut Turn,
        request: ItemRequest,
        options: Vec<ProductCandidate>,
        remaining: Vec<ItemRequest>,
        mut errors: Vec<String>,
        mut shortages: Vec<StockShortage>,
    ) -> Option<OutboundReply> {
        let ids: Vec<String> = options.iter().map(option_id).collect();
        let selected = pick_index(&turn.input.text, &ids).or_else(|| {
            match self.matcher.resolve(&turn.input.text, &options) {
                MatchResult::Match { candidate } => {
                    options.iter().position(|option| option.same_line(&candidate))
                }
                _ => None,
            }
        })?;

        let candidate = options[selected].clone();
        let quantity = candidate.base_quantity(request.quantity, request.secondary_unit);
        let added = self.add_line(turn, &candidate, quantity, &mut errors, &mut shortages).await;
        let added = usize::from(added);
        self.collect_items(turn, remaining, errors, shortages, added, false).await
    }

    pub(super) async fn handle_shortage(
        &self,
        turn: &mut Turn,
        shortage: StockShortage,
    ) -> Option<OutboundReply> {
        let mut errors = Vec::new();
        match parse_reply(&turn.input.text) {
            ConfirmationReply::Yes => {
                let input = line_input(
                    &shortage.product_id,
                    shortage.variant_id.as_ref(),
                    shortage.available,
                );
                match self.run_tool(turn, "add_to_cart", input).await {
                    Ok(outcome) if outcome.success => {}
                    Ok(outcome) => errors.push(outcome.user_message()),
                    Err(_) => errors.push(format!("I couldn't add {} right now.", shortage.name)),
                }
            }
            ConfirmationReply::No => errors.push(format!("Okay, no {}.", shortage.name)),
            ConfirmationReply::Unclear => return None,
        }
        Some(self.finish_collection(turn, errors, Vec::new()))
    }
}

fn line_input(product_id: &ProductId, variant_id: Option<&VariantId>, quantity: u32) -> Value {
    let mut input = json!({ "product_id": product_id.0, "quantity": quantity });
    if let Some(variant) = variant_id {
        input["variant_id"] = json!(variant.0);
    }
    input
}

/// Reads the `insufficient_stock` failure shape produced by cart tools.
pub(super) fn shortage_from(outcome: &ToolOutcome) -> Option<StockShortage> {
    if !outcome.is_insufficient_stock() {
        return None;
    }
    let data = outcome.data.as_ref()?;
    let count = |key: &str| {
        data.get(key).and_then(Value::as_u64).and_then(|value| u32::try_from(value).ok())
    };
    Some(StockShortage {
        product_id: ProductId(data.get("product_id")?.as_str()?.to_string()),
        variant_id: data
            .get("variant_id")
            .and_then(Value::as_str)
            .map(|id| VariantId(id.to_string())),
        name: data.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        requested: count("requested").unwrap_or_default(),
        available: count("available")?,
    })
}

fn shortage_line(shortage: &StockShortage) -> String {
    if shortage.available == 0 {
        format!("{} is out of stock.", shortage.name)
    } else {
        format!("Only {} of {} available.", shortage.available, shortage.name)
    }
}

pub(super) fn option_id(candidate: &ProductCandidate) -> String {
    match &candidate.variant_id {
        Some(variant) => format!("{}:{}", candidate.product_id.0, variant.0),
        None => candidate.product_id.0.clone(),
    }
}

/// Matches an interactive option id or a 1-based list number.
pub(super) fn pick_index(text: &str, ids: &[String]) -> Option<usize> {
    let trimmed = text.trim();
    if let Some(position) = ids.iter().position(|id| id.eq_ignore_ascii_case(trimmed)) {
        return Some(position);
    }
    let number: usize = normalize(trimmed).parse().ok()?;
    (1..=ids.len()).contains(&number).then(|| number - 1)
}

fn selection_reply(request: &ItemRequest, options: &[ProductCandidate]) -> OutboundReply {
    let items = options
        .iter()
        .map(|option| ListItem {
            id: option_id(option),
            title: option.name.clone(),
            description: Some(option.price.round_dp(2).to_string()),
        })
        .collect();
    OutboundReply::list(format!("Which \"{}\" did you mean?", request.name), "Choose", items)
}
