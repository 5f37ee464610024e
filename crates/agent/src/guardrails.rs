use serde_json::Value;

use parley_core::domain::session::ConversationMode;

use crate::tools::ToolRegistry;

const CART_TOOLS: &[&str] = &["add_to_cart", "set_cart_quantity"];
const PRICE_FIELDS: &[&str] = &["price", "unit_price", "total", "subtotal", "discount"];

/// A tool call the reasoning service asked for.
#[derive(Clone, Copy, Debug)]
pub struct ToolRequest<'a> {
    pub name: &'a str,
    pub input: &'a Value,
    pub mode: ConversationMode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    /// Risky call: store a proposal and wait for an explicit yes.
    RequireConfirmation,
    Deny { reason_code: &'static str, user_message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub llm_can_set_prices: bool,
    pub confirm_risky_tools: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { llm_can_set_prices: false, confirm_risky_tools: true }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(
        &self,
        request: &ToolRequest<'_>,
        registry: &ToolRegistry,
    ) -> GuardrailDecision {
        if !registry.contains(request.name) {
            return GuardrailDecision::Deny {
                reason_code: "unknown_tool",
                user_message: format!("Tool `{}` does not exist.", request.name),
            };
        }
        if !registry.allowed_in(request.name, request.mode) {
            return GuardrailDecision::Deny {
                reason_code: "tool_not_allowed_in_mode",
                user_message: format!(
                    "Tool `{}` is not available in {} mode.",
                    request.name,
                    request.mode.as_str()
                ),
            };
        }
        if !self.llm_can_set_prices && carries_price(request) {
            return GuardrailDecision::Deny {
                reason_code: "price_override_disallowed",
                user_message: "Prices come from the catalog and cannot be set from chat."
                    .to_string(),
            };
        }
        if self.confirm_risky_tools && registry.requires_confirmation(request.name) {
            return GuardrailDecision::RequireConfirmation;
        }
        GuardrailDecision::Allow
    }
}

fn carries_price(request: &ToolRequest<'_>) -> bool {
    CART_TOOLS.contains(&request.name)
        && request
            .input
            .as_object()
            .is_some_and(|fields| PRICE_FIELDS.iter().any(|field| fields.contains_key(*field)))
}
