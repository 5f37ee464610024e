use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub String);

/// Identity of a conversation: tenant, channel and end-user address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub workspace_id: String,
    pub channel: String,
    pub sender: String,
}

impl ConversationKey {
    pub fn new(
        workspace_id: impl Into<String>,
        channel: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self { workspace_id: workspace_id.into(), channel: channel.into(), sender: sender.into() }
    }

    /// Stable string form used for lock rows and session ids.
    pub fn as_key(&self) -> String {
        format!("{}:{}:{}", self.workspace_id, self.channel, self.sender)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(rename = "dlq")]
    DeadLettered,
}

impl InboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dlq",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dlq" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Terminal records are never processed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }
}

/// Ledger row for one physical inbound event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEventRecord {
    pub correlation_id: CorrelationId,
    pub conversation_key: ConversationKey,
    pub status: InboundStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub payload: Value,
    /// Text extracted from the payload at ingestion time.
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<BatchId>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl InboundEventRecord {
    pub fn new_pending(
        correlation_id: CorrelationId,
        conversation_key: ConversationKey,
        payload: Value,
        text: impl Into<String>,
        max_retries: u32,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            conversation_key,
            status: InboundStatus::Pending,
            retry_count: 0,
            max_retries,
            payload,
            text: text.into(),
            received_at,
            available_at: received_at,
            claimed_by: None,
            claimed_at: None,
            batch_id: None,
            last_error: None,
            updated_at: received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationKey, InboundStatus};

    #[test]
    fn status_storage_encoding_round_trips() {
        for status in [
            InboundStatus::Pending,
            InboundStatus::Processing,
            InboundStatus::Completed,
            InboundStatus::Failed,
            InboundStatus::DeadLettered,
        ] {
            assert_eq!(InboundStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_string(&InboundStatus::DeadLettered).expect("serialize"),
            "\"dlq\""
        );
        assert!(InboundStatus::Completed.is_terminal());
        assert!(!InboundStatus::Failed.is_terminal());
    }

    #[test]
    fn conversation_key_formats_as_colon_triple() {
        let key = ConversationKey::new("ws-1", "whatsapp", "+5511999");
        assert_eq!(key.as_key(), "ws-1:whatsapp:+5511999");
        assert_eq!(key.to_string(), key.as_key());
    }
}
