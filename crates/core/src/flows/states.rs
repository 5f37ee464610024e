use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation phase driving how an inbound turn is routed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    #[default]
    Idle,
    CollectingOrder,
    NeedsDetails,
    AwaitingConfirmation,
    Executing,
    Done,
    Handoff,
}

impl ConversationState {
    pub const ALL: [ConversationState; 7] = [
        Self::Idle,
        Self::CollectingOrder,
        Self::NeedsDetails,
        Self::AwaitingConfirmation,
        Self::Executing,
        Self::Done,
        Self::Handoff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CollectingOrder => "COLLECTING_ORDER",
            Self::NeedsDetails => "NEEDS_DETAILS",
            Self::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Self::Executing => "EXECUTING",
            Self::Done => "DONE",
            Self::Handoff => "HANDOFF",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// States from which free-text item requests may be added to the cart.
    pub fn accepts_order_items(&self) -> bool {
        matches!(self, Self::Idle | Self::CollectingOrder | Self::NeedsDetails | Self::Done)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConversationState,
    pub to: ConversationState,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::ConversationState;

    #[test]
    fn storage_encoding_round_trips_for_every_state() {
        for state in ConversationState::ALL {
            assert_eq!(ConversationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(
            ConversationState::parse(" awaiting_confirmation "),
            Some(ConversationState::AwaitingConfirmation)
        );
        assert_eq!(ConversationState::parse("paused"), None);
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ConversationState::CollectingOrder).expect("serialize");
        assert_eq!(json, "\"COLLECTING_ORDER\"");
    }
}
