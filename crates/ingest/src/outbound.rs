use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use parley_core::domain::inbound::ConversationKey;
use parley_core::domain::reply::OutboundReply;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound client could not be built: {0}")]
    Client(String),
    #[error("outbound request failed: {0}")]
    Request(String),
    #[error("outbound endpoint rejected the reply with status {0}")]
    Rejected(u16),
}

/// Sends a reply back to the customer on the channel it came from.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn deliver(
        &self,
        key: &ConversationKey,
        reply: &OutboundReply,
        correlation_id: &str,
    ) -> Result<(), DeliveryError>;
}

/// Logs replies instead of sending them; used when no webhook is configured.
#[derive(Default)]
pub struct NoopOutboundChannel;

#[async_trait]
impl OutboundChannel for NoopOutboundChannel {
    async fn deliver(
        &self,
        key: &ConversationKey,
        reply: &OutboundReply,
        correlation_id: &str,
    ) -> Result<(), DeliveryError> {
        info!(
            event_name = "egress.reply_dropped",
            conversation_key = %key,
            correlation_id,
            body = reply.body(),
            "no outbound channel configured; reply logged only"
        );
        Ok(())
    }
}

/// POSTs each reply as JSON to the channel adapter.
pub struct WebhookOutboundChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookOutboundChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DeliveryError::Client(error.to_string()))?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl OutboundChannel for WebhookOutboundChannel {
    async fn deliver(
        &self,
        key: &ConversationKey,
        reply: &OutboundReply,
        correlation_id: &str,
    ) -> Result<(), DeliveryError> {
        let body = json!({
            "workspace_id": key.workspace_id,
            "channel": key.channel,
            "recipient": key.sender,
            "correlation_id": correlation_id,
            "reply": reply,
            "fallback_text": reply.fallback_text(),
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|error| DeliveryError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected(status.as_u16()));
        }
        debug!(
            event_name = "egress.reply_sent",
            conversation_key = %key,
            correlation_id,
            "reply delivered"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredReply {
    pub key: ConversationKey,
    pub reply: OutboundReply,
    pub correlation_id: String,
}

/// Keeps every reply in memory; handy for tests and dry runs.
#[derive(Default)]
pub struct RecordingOutboundChannel {
    delivered: Mutex<Vec<DeliveredReply>>,
}

impl RecordingOutboundChannel {
    pub async fn delivered(&self) -> Vec<DeliveredReply> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl OutboundChannel for RecordingOutboundChannel {
    async fn deliver(
        &self,
        key: &ConversationKey,
        reply: &OutboundReply,
        correlation_id: &str,
    ) -> Result<(), DeliveryError> {
        self.delivered.lock().await.push(DeliveredReply {
            key: key.clone(),
            reply: reply.clone(),
            correlation_id: correlation_id.to_owned(),
        });
        Ok(())
    }
}
