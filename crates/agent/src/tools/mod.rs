//! Tool registry shared by the reasoning loop, quick-parse and the sub-flow
//! handlers. Tools never set prices: cart tools read them from the catalog
//! snapshot handed in through [`ToolContext`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use parley_core::domain::catalog::ProductCandidate;
use parley_core::domain::session::{ConversationMode, SessionMemory};
use parley_core::flows::ConversationState;

use crate::llm::ToolDefinition;

pub mod cart;
pub mod remote;

pub use cart::{
    cart_json, register_cart_tools, AddToCart, ClearCart, ReviewCart, SetCartQuantity, ViewCart,
};
pub use remote::RemoteTool;

pub const INSUFFICIENT_STOCK: &str = "insufficient_stock";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid input for `{tool}`: {message}")]
    InvalidInput { tool: String, message: String },
    #[error("remote tool `{tool}` failed: {message}")]
    Remote { tool: String, message: String },
}

/// Result of one tool call, fed back to the reasoning service as a tool_result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_transition: Option<ConversationState>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), ..Self::default() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Self::default() }
    }

    pub fn failure_with_data(error: impl Into<String>, data: Value) -> Self {
        Self { success: false, data: Some(data), error: Some(error.into()), ..Self::default() }
    }

    pub fn with_transition(mut self, state: ConversationState) -> Self {
        self.state_transition = Some(state);
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref().and_then(|data| data.get(key)).and_then(Value::as_str)
    }

    pub fn is_insufficient_stock(&self) -> bool {
        !self.success && self.data_str("code") == Some(INSUFFICIENT_STOCK)
    }

    /// Content of the tool_result block sent back to the reasoning service.
    pub fn to_result_content(&self) -> String {
        let mut body = json!({ "success": self.success });
        if let Some(data) = &self.data {
            body["data"] = data.clone();
        }
        if let Some(error) = &self.error {
            body["error"] = json!(error);
        }
        body.to_string()
    }

    /// The message shown to the user when the call failed.
    pub fn user_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "That didn't work, please try again.".to_string())
    }
}

/// Mutable turn state a tool may read or change.
pub struct ToolContext<'a> {
    pub memory: &'a mut SessionMemory,
    pub catalog: &'a [ProductCandidate],
    pub correlation_id: &'a str,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Modes whose allow-list includes this tool.
    fn modes(&self) -> &[ConversationMode];

    fn requires_confirmation(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in cart tools.
    pub fn with_cart_tools() -> Self {
        let mut registry = Self::new();
        register_cart_tools(&mut registry);
        registry
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn allowed_in(&self, name: &str, mode: ConversationMode) -> bool {
        self.tools.get(name).is_some_and(|tool| tool.modes().contains(&mode))
    }

    /// Schemas advertised to the reasoning service for `mode`, sorted by name.
    pub fn definitions(&self, mode: ConversationMode) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|tool| tool.modes().contains(&mode))
            .map(|tool| tool.definition())
            .collect();
        definitions.sort_by(|left, right| left.name.cmp(&right.name));
        definitions
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|tool| tool.requires_confirmation())
    }

    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let outcome = tool.execute(input, context).await;
        match &outcome {
            Ok(result) => tracing::info!(
                event_name = "tool.executed",
                tool_name = name,
                correlation_id = context.correlation_id,
                session_id = %context.memory.session_id.0,
                success = result.success,
                "tool executed"
            ),
            Err(error) => tracing::warn!(
                event_name = "tool.failed",
                tool_name = name,
                correlation_id = context.correlation_id,
                session_id = %context.memory.session_id.0,
                error = %error,
                "tool call failed"
            ),
        }
        outcome
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ToolOutcome, ToolRegistry};
    use parley_core::domain::session::ConversationMode;
    use parley_core::flows::ConversationState;

    #[test]
    fn cart_tools_are_advertised_per_mode() {
        let registry = ToolRegistry::with_cart_tools();
        assert_eq!(registry.len(), 5);

        let ordering: Vec<String> = registry
            .definitions(ConversationMode::Ordering)
            .into_iter()
            .map(|definition| definition.name)
            .collect();
        assert_eq!(
            ordering,
            vec!["add_to_cart", "clear_cart", "review_cart", "set_cart_quantity", "view_cart"]
        );

        let informational = registry.definitions(ConversationMode::Informational);
        assert_eq!(informational.len(), 1);
        assert_eq!(informational[0].name, "view_cart");
        assert!(!registry.allowed_in("add_to_cart", ConversationMode::Payment));
        assert!(!registry.requires_confirmation("clear_cart"));
    }

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let outcome = ToolOutcome::ok(json!({"order_id": "ORD-1"}))
            .with_transition(ConversationState::Done);
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["state_transition"], "DONE");
        assert!(value.get("error").is_none());

        let parsed: ToolOutcome =
            serde_json::from_value(json!({"success": false, "error": "store closed"}))
                .expect("deserialize");
        assert_eq!(parsed.user_message(), "store closed");
        assert!(parsed.state_transition.is_none());
    }

    #[test]
    fn insufficient_stock_shape_is_recognized() {
        let outcome = ToolOutcome::failure_with_data(
            "Only 3 left",
            json!({"code": "insufficient_stock", "available": 3}),
        );
        assert!(outcome.is_insufficient_stock());
        assert!(outcome.to_result_content().contains("\"available\":3"));
    }
}
