use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::inbound::{ConversationKey, CorrelationId};
use crate::domain::session::{CustomerId, SessionId};

/// Durable per-conversation bookkeeping kept outside the session aggregate so
/// that it survives session expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_key: ConversationKey,
    pub session_id: SessionId,
    pub customer_id: Option<CustomerId>,
    pub consecutive_failures: u32,
    pub automation_enabled: bool,
    pub handoff_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(conversation_key: ConversationKey, now: DateTime<Utc>) -> Self {
        let session_id = SessionId(conversation_key.as_key());
        Self {
            conversation_key,
            session_id,
            customer_id: None,
            consecutive_failures: 0,
            automation_enabled: true,
            handoff_reason: None,
            updated_at: now,
        }
    }

    pub fn in_handoff(&self) -> bool {
        !self.automation_enabled
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub correlation_id: CorrelationId,
    pub conversation_key: ConversationKey,
    pub payload: Value,
    pub retry_count: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::ConversationRecord;
    use crate::domain::inbound::ConversationKey;

    #[test]
    fn new_record_derives_session_from_key_and_enables_automation() {
        let record = ConversationRecord::new(ConversationKey::new("ws", "sms", "+1"), Utc::now());
        assert_eq!(record.session_id.0, "ws:sms:+1");
        assert!(!record.in_handoff());
        assert_eq!(record.consecutive_failures, 0);
    }
}
