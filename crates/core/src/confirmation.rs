//! Two-phase commit for risky tool calls: render a proposal, store it on the
//! session, and execute only after an explicit yes.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tera::{Context, Tera};
use thiserror::Error;

use crate::domain::confirmation::{ConfirmationReply, PendingConfirmation};
use crate::text::normalize;

pub const DEFAULT_TTL_MINUTES: i64 = 15;
const DEFAULT_TEMPLATE: &str = "default";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "cancel_order",
        "Cancel order {{ input.order_id }}? This cannot be undone.\n\
         Reply YES to cancel it or NO to keep it.",
    ),
    (
        "adjust_stock",
        "Adjust stock of {{ input.product_id }} by {{ input.delta }}\
         {% if input.reason %} ({{ input.reason }}){% endif %}?\n\
         Reply YES to apply or NO to discard.",
    ),
    (
        "update_price",
        "Change the price of {{ input.product_id }} to {{ input.price }}?\n\
         Reply YES to apply or NO to discard.",
    ),
    (
        DEFAULT_TEMPLATE,
        "Please confirm: {{ tool_label }}\n\
         {% for key, value in input %}- {{ key }}: {{ value }}\n{% endfor %}\
         Reply YES to confirm or NO to cancel.",
    ),
];

const AFFIRMATIVE: &[&str] = &[
    "yes", "y", "yeah", "yep", "yup", "sure", "ok", "okay", "confirm", "confirmed", "go ahead",
    "do it", "sim", "si", "s", "claro", "pode", "isso", "confirmo", "correct",
];

const NEGATIVE: &[&str] = &[
    "no", "n", "nope", "nah", "cancel", "stop", "dont", "don t", "nao", "negative", "never mind",
    "keep it", "abort",
];

const MAX_REPLY_TOKENS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("invalid confirmation template `{name}`: {message}")]
    Template { name: String, message: String },
}

#[derive(Clone, Debug)]
pub struct ConfirmationGate {
    templates: Tera,
    ttl: Duration,
}

impl ConfirmationGate {
    pub fn new() -> Result<Self, ConfirmationError> {
        Self::with_ttl(Duration::minutes(DEFAULT_TTL_MINUTES))
    }

    pub fn with_ttl(ttl: Duration) -> Result<Self, ConfirmationError> {
        let mut templates = Tera::default();
        for (name, source) in BUILTIN_TEMPLATES {
            templates.add_raw_template(name, source).map_err(|error| {
                ConfirmationError::Template { name: (*name).to_owned(), message: error.to_string() }
            })?;
        }
        Ok(Self { templates, ttl })
    }

    /// Registers or replaces the prompt used for `tool_name`.
    pub fn register_template(
        &mut self,
        tool_name: &str,
        source: &str,
    ) -> Result<(), ConfirmationError> {
        self.templates.add_raw_template(tool_name, source).map_err(|error| {
            ConfirmationError::Template { name: tool_name.to_owned(), message: error.to_string() }
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn build_request(
        &self,
        tool_name: &str,
        input: &Value,
        now: DateTime<Utc>,
    ) -> PendingConfirmation {
        PendingConfirmation {
            tool_name: tool_name.to_owned(),
            tool_input: input.clone(),
            message: self.render(tool_name, input),
            created_at: now,
            expires_at: now + self.ttl,
        }
    }

    /// Renders the tool's own template, falling back to the generic one when
    /// the tool has none or its input lacks a referenced field.
    fn render(&self, tool_name: &str, input: &Value) -> String {
        let mut context = Context::new();
        context.insert("tool_name", tool_name);
        context.insert("tool_label", &tool_name.replace('_', " "));
        context.insert("input", input);

        let has_own = self.templates.get_template_names().any(|name| name == tool_name);
        if has_own {
            match self.templates.render(tool_name, &context) {
                Ok(rendered) => return rendered,
                Err(error) => tracing::warn!(
                    event_name = "confirmation.template_fallback",
                    tool_name,
                    error = %error,
                    "tool confirmation template failed, using generic prompt"
                ),
            }
        }

        self.templates.render(DEFAULT_TEMPLATE, &context).unwrap_or_else(|_| {
            format!(
                "Please confirm: {}. Reply YES to confirm or NO to cancel.",
                tool_name.replace('_', " ")
            )
        })
    }
}

/// Classifies a free-text answer to a pending proposal.
pub fn parse_reply(text: &str) -> ConfirmationReply {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return ConfirmationReply::Unclear;
    }
    let tokens: Vec<&str> = normalized.split(' ').collect();
    if tokens.len() > MAX_REPLY_TOKENS {
        return ConfirmationReply::Unclear;
    }

    let yes = phrase_hit(&normalized, &tokens, AFFIRMATIVE);
    let no = phrase_hit(&normalized, &tokens, NEGATIVE);
    match (yes, no) {
        (true, false) => ConfirmationReply::Yes,
        (false, true) => ConfirmationReply::No,
        _ => ConfirmationReply::Unclear,
    }
}

fn phrase_hit(normalized: &str, tokens: &[&str], vocabulary: &[&str]) -> bool {
    vocabulary.iter().any(|phrase| {
        if phrase.contains(' ') {
            normalized == *phrase || normalized.starts_with(&format!("{phrase} "))
        } else {
            tokens.first() == Some(phrase) || (tokens.len() <= 2 && tokens.contains(phrase))
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{parse_reply, ConfirmationGate};
    use crate::domain::confirmation::ConfirmationReply;

    #[test]
    fn cancel_order_template_renders_order_id() {
        let gate = ConfirmationGate::new().expect("gate");
        let now = Utc::now();
        let pending = gate.build_request("cancel_order", &json!({"order_id": "ORD-7"}), now);

        assert_eq!(pending.tool_name, "cancel_order");
        assert!(pending.message.starts_with("Cancel order ORD-7?"));
        assert_eq!(pending.expires_at, now + Duration::minutes(15));
        assert_eq!(pending.tool_input["order_id"], "ORD-7");
    }

    #[test]
    fn missing_field_falls_back_to_generic_template() {
        let gate = ConfirmationGate::new().expect("gate");
        let pending = gate.build_request("cancel_order", &json!({"reason": "dup"}), Utc::now());

        assert!(pending.message.starts_with("Please confirm: cancel order"));
        assert!(pending.message.contains("- reason: dup"));
    }

    #[test]
    fn unknown_tool_uses_generic_template() {
        let gate = ConfirmationGate::new().expect("gate");
        let pending = gate.build_request("refund_payment", &json!({"amount": 10}), Utc::now());
        assert!(pending.message.starts_with("Please confirm: refund payment"));
        assert!(pending.message.ends_with("Reply YES to confirm or NO to cancel."));
    }

    #[test]
    fn custom_template_and_ttl_are_honoured() {
        let mut gate = ConfirmationGate::with_ttl(Duration::minutes(5)).expect("gate");
        gate.register_template("refund_payment", "Refund {{ input.amount }}?").expect("register");
        let now = Utc::now();
        let pending = gate.build_request("refund_payment", &json!({"amount": 10}), now);
        assert_eq!(pending.message, "Refund 10?");
        assert_eq!(pending.expires_at, now + Duration::minutes(5));
    }

    #[test]
    fn parse_reply_understands_multilingual_yes_and_no() {
        for text in ["yes", "YES!", "y", "ok", "Sim", "sí", "confirm please", "go ahead"] {
            assert_eq!(parse_reply(text), ConfirmationReply::Yes, "{text}");
        }
        for text in ["no", "No.", "nope", "não", "cancel", "never mind"] {
            assert_eq!(parse_reply(text), ConfirmationReply::No, "{text}");
        }
    }

    #[test]
    fn parse_reply_is_unclear_for_other_text() {
        for text in ["", "maybe", "what is the total of my order today", "yes no"] {
            assert_eq!(parse_reply(text), ConfirmationReply::Unclear, "{text}");
        }
    }
}
