use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use parley_core::domain::inbound::{ConversationKey, CorrelationId};
use parley_core::domain::session::CustomerId;

/// One physical inbound event as posted by a channel adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub correlation_id: String,
    pub workspace_id: String,
    pub channel: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub payload: InboundPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPayload {
    Text {
        text: String,
    },
    Attachment {
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A tapped quick reply or list row.
    Interactive {
        option_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

impl InboundPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Attachment { .. } => "attachment",
            Self::Interactive { .. } => "interactive",
            Self::Unsupported => "unsupported",
        }
    }

    /// Plain text handed to the orchestrator. Attachments become
    /// `[attachment:<kind>] <caption>`; interactive replies carry the option id.
    pub fn extract_text(&self) -> Option<String> {
        let text = match self {
            Self::Text { text } => text.trim().to_string(),
            Self::Attachment { kind, caption, .. } => {
                let caption = caption.as_deref().map(str::trim).unwrap_or_default();
                format!("[attachment:{}] {caption}", kind.trim()).trim_end().to_string()
            }
            Self::Interactive { option_id, .. } => option_id.trim().to_string(),
            Self::Unsupported => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope field `{0}` is empty")]
    MissingField(&'static str),
    #[error("unsupported payload type")]
    Unsupported,
    #[error("payload carries no content")]
    EmptyContent,
}

impl InboundEnvelope {
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        for (field, value) in [
            ("correlation_id", &self.correlation_id),
            ("workspace_id", &self.workspace_id),
            ("channel", &self.channel),
            ("sender", &self.sender),
        ] {
            if value.trim().is_empty() {
                return Err(EnvelopeError::MissingField(field));
            }
        }
        match &self.payload {
            InboundPayload::Unsupported => Err(EnvelopeError::Unsupported),
            payload if payload.extract_text().is_none() => Err(EnvelopeError::EmptyContent),
            _ => Ok(()),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId(self.correlation_id.trim().to_string())
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.workspace_id.trim(), self.channel.trim(), self.sender.trim())
    }

    pub fn customer(&self) -> Option<CustomerId> {
        self.customer_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| CustomerId(id.to_string()))
    }
}
