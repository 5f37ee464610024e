use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use parley_core::config::{LlmConfig, LlmProvider};
use parley_core::domain::message::{ContentBlock, MessageRole, StoredMessage};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning service is disabled")]
    Disabled,
    #[error("reasoning service timed out")]
    Timeout,
    #[error("reasoning service authentication failed: {0}")]
    Authentication(String),
    #[error("reasoning service rate limit exceeded")]
    RateLimited,
    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),
    #[error("reasoning service rejected the request: {0}")]
    InvalidRequest(String),
    #[error("could not parse reasoning response: {0}")]
    InvalidResponse(String),
}

impl ReasoningError {
    /// Failures of one call that a later turn may not see again. The others
    /// mean the client itself is misconfigured.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Unavailable(_) | Self::InvalidResponse(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasoningMessage {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl ReasoningMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: vec![ContentBlock::text(text)] }
    }
}

impl From<&StoredMessage> for ReasoningMessage {
    fn from(message: &StoredMessage) -> Self {
        Self { role: message.role, content: message.content.clone() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReasoningRequest {
    pub system: String,
    pub messages: Vec<ReasoningMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "end_turn" | "stop_sequence" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReasoningResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ReasoningResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            content: vec![ContentBlock::ToolUse { id: id.into(), name: name.into(), input }],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        }
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    pub fn joined_text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.trim()),
                _ => None,
            })
            .filter(|text| !text.is_empty())
            .collect();
        parts.join("\n")
    }
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(&self, request: ReasoningRequest)
        -> Result<ReasoningResponse, ReasoningError>;
}

/// Used when no provider is configured; the orchestrator answers with its
/// deterministic fallback instead.
#[derive(Clone, Debug, Default)]
pub struct DisabledReasoningClient;

#[async_trait]
impl ReasoningClient for DisabledReasoningClient {
    async fn complete(
        &self,
        _request: ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        Err(ReasoningError::Disabled)
    }
}

pub struct AnthropicReasoningClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl AnthropicReasoningClient {
    pub fn new(
        api_key: SecretString,
        base_url: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ReasoningError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ReasoningError::Unavailable(error.to_string()))?;
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self { client, api_key, base_url, model: model.into() })
    }

    fn payload(&self, request: &ReasoningRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect();
        let mut payload = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            payload["tools"] = json!(request.tools);
        }
        payload
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<Value>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

/// Keeps text and tool_use blocks; other block kinds the API may add are skipped.
fn parse_content(blocks: Vec<Value>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") | Some("tool_use") => serde_json::from_value(block).ok(),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl ReasoningClient for AnthropicReasoningClient {
    async fn complete(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.payload(&request))
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ReasoningError::Timeout
                } else {
                    ReasoningError::Unavailable(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ReasoningError::Authentication(body),
                429 => ReasoningError::RateLimited,
                code if code >= 500 => ReasoningError::Unavailable(format!("{status}: {body}")),
                _ => ReasoningError::InvalidRequest(body),
            });
        }

        let data: MessagesResponse = response
            .json()
            .await
            .map_err(|error| ReasoningError::InvalidResponse(error.to_string()))?;

        Ok(ReasoningResponse {
            content: parse_content(data.content),
            stop_reason: data
                .stop_reason
                .as_deref()
                .map(StopReason::parse)
                .unwrap_or(StopReason::EndTurn),
            usage: data.usage,
        })
    }
}

/// Builds the client selected by `[llm]`.
pub fn client_from_config(config: &LlmConfig) -> Result<Arc<dyn ReasoningClient>, ReasoningError> {
    match config.provider {
        LlmProvider::Disabled => Ok(Arc::new(DisabledReasoningClient)),
        LlmProvider::Anthropic => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ReasoningError::Authentication("llm.api_key is not set".to_string())
            })?;
            let client = AnthropicReasoningClient::new(
                api_key,
                config.base_url.clone(),
                config.model.clone(),
                Duration::from_secs(config.timeout_secs),
            )?;
            Ok(Arc::new(client))
        }
    }
}

/// Replays canned responses in order and records every request it saw.
/// Running out of script is reported as an unavailable service.
#[derive(Clone, Default)]
pub struct ScriptedReasoningClient {
    script: Arc<Mutex<VecDeque<Result<ReasoningResponse, ReasoningError>>>>,
    requests: Arc<Mutex<Vec<ReasoningRequest>>>,
    delay: Option<Duration>,
}

impl ScriptedReasoningClient {
    pub fn new(responses: Vec<ReasoningResponse>) -> Self {
        let script = responses.into_iter().map(Ok).collect();
        Self { script: Arc::new(Mutex::new(script)), ..Self::default() }
    }

    pub fn push_error(&self, error: ReasoningError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    async fn complete(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        next.unwrap_or_else(|| Err(ReasoningError::Unavailable("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::{
        parse_content, AnthropicReasoningClient, ReasoningError, ReasoningMessage,
        ReasoningRequest, ReasoningResponse, StopReason, ToolDefinition,
    };
    use parley_core::domain::message::ContentBlock;

    #[test]
    fn payload_carries_tools_and_typed_content_blocks() {
        let client = AnthropicReasoningClient::new(
            SecretString::from("sk-test".to_string()),
            Some("http://localhost:9/v1/".to_string()),
            "claude-test",
            std::time::Duration::from_secs(5),
        )
        .expect("client");
        let request = ReasoningRequest {
            system: "be brief".to_string(),
            messages: vec![ReasoningMessage::user_text("2 sodas")],
            tools: vec![ToolDefinition {
                name: "view_cart".to_string(),
                description: "Show the cart".to_string(),
                input_schema: json!({"type": "object"}),
            }],
            max_tokens: 256,
        };

        let payload = client.payload(&request);
        assert_eq!(client.base_url, "http://localhost:9/v1");
        assert_eq!(payload["model"], "claude-test");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"][0]["type"], "text");
        assert_eq!(payload["tools"][0]["name"], "view_cart");
    }

    #[test]
    fn unknown_content_blocks_are_skipped() {
        let blocks = parse_content(vec![
            json!({"type": "thinking", "thinking": "hmm"}),
            json!({"type": "text", "text": "Sure."}),
            json!({"type": "tool_use", "id": "t1", "name": "view_cart", "input": {}}),
        ]);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[1], ContentBlock::ToolUse { ref name, .. } if name == "view_cart"));
    }

    #[test]
    fn stop_reason_parsing_and_text_join() {
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("refusal"), StopReason::Other("refusal".to_string()));

        let mut response = ReasoningResponse::text(" Hello ");
        response.content.push(ContentBlock::text("there"));
        assert_eq!(response.joined_text(), "Hello\nthere");
    }

    #[test]
    fn only_service_side_failures_are_transient() {
        assert!(ReasoningError::Timeout.is_transient());
        assert!(ReasoningError::RateLimited.is_transient());
        assert!(ReasoningError::Unavailable("overloaded".to_string()).is_transient());
        assert!(ReasoningError::InvalidResponse("truncated".to_string()).is_transient());
        assert!(!ReasoningError::Authentication("bad key".to_string()).is_transient());
        assert!(!ReasoningError::InvalidRequest("bad model".to_string()).is_transient());
        assert!(!ReasoningError::Disabled.is_transient());
    }
}
