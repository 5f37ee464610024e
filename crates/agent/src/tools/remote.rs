use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use parley_core::config::RemoteToolConfig;
use parley_core::domain::session::ConversationMode;

use super::{Tool, ToolContext, ToolError, ToolOutcome};
use crate::llm::ToolDefinition;

/// Tool declared under `[[tools.remote]]` and executed by HTTP POST. The
/// endpoint answers with a `ToolOutcome` JSON body.
pub struct RemoteTool {
    config: RemoteToolConfig,
    client: reqwest::Client,
}

impl RemoteTool {
    pub fn new(config: RemoteToolConfig) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ToolError::Remote {
                tool: config.name.clone(),
                message: error.to_string(),
            })?;
        Ok(Self { config, client })
    }

    fn request_body(&self, input: &Value, context: &ToolContext<'_>) -> Value {
        json!({
            "tool": self.config.name,
            "input": input,
            "session_id": context.memory.session_id.0,
            "workspace_id": context.memory.workspace_id.0,
            "customer_id": context.memory.customer_id.as_ref().map(|customer| customer.0.clone()),
            "correlation_id": context.correlation_id,
        })
    }

    fn remote_error(&self, message: impl Into<String>) -> ToolError {
        ToolError::Remote { tool: self.config.name.clone(), message: message.into() }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            input_schema: self
                .config
                .input_schema
                .clone()
                .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        &self.config.modes
    }

    fn requires_confirmation(&self) -> bool {
        self.config.requires_confirmation
    }

    async fn execute(
        &self,
        input: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&self.request_body(&input, context))
            .send()
            .await
            .map_err(|error| self.remote_error(error.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.remote_error(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(ToolOutcome::failure(if body.trim().is_empty() {
                format!("{} was rejected ({status}).", self.config.name.replace('_', " "))
            } else {
                body
            }));
        }

        response
            .json::<ToolOutcome>()
            .await
            .map_err(|error| self.remote_error(format!("invalid response body: {error}")))
    }
}
