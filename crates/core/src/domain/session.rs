use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::cart::Cart;
use crate::domain::catalog::{ProductCandidate, ProductId, VariantId};
use crate::domain::confirmation::PendingConfirmation;
use crate::flows::{ConversationState, StateMachine, StateTransition};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

/// Tool allow-list the reasoning loop runs under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    #[default]
    Ordering,
    Informational,
    Payment,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordering => "ordering",
            Self::Informational => "informational",
            Self::Payment => "payment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ordering" => Some(Self::Ordering),
            "informational" => Some(Self::Informational),
            "payment" => Some(Self::Payment),
            _ => None,
        }
    }
}

/// One free-text "quantity + name" request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub quantity: u32,
    pub name: String,
    /// Quantity was expressed in the product's secondary unit ("2 boxes of soda").
    pub secondary_unit: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub name: String,
    pub requested: u32,
    pub available: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: String,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStage {
    ChoosingMethod,
    AwaitingProof,
}

/// The single multi-turn sub-flow a conversation may be inside. Modelled as one
/// enum so that two sub-flows can never be active at once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActiveSubflow {
    ProductSelection {
        request: ItemRequest,
        options: Vec<ProductCandidate>,
        remaining: Vec<ItemRequest>,
        errors: Vec<String>,
        shortages: Vec<StockShortage>,
    },
    OrderSelection {
        tool_name: String,
        options: Vec<OrderSummary>,
    },
    ShortageResolution {
        shortage: StockShortage,
    },
    Payment {
        order_id: String,
        stage: PaymentStage,
    },
}

impl ActiveSubflow {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProductSelection { .. } => "product_selection",
            Self::OrderSelection { .. } => "order_selection",
            Self::ShortageResolution { .. } => "shortage_resolution",
            Self::Payment { .. } => "payment",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnContext {
    pub subflow: Option<ActiveSubflow>,
    /// Existing order being amended; checkout updates it instead of creating one.
    pub editing_order: Option<String>,
    pub mode_hint: Option<ConversationMode>,
}

impl TurnContext {
    pub fn mode(&self) -> ConversationMode {
        match (&self.subflow, self.mode_hint) {
            (Some(ActiveSubflow::Payment { .. }), _) => ConversationMode::Payment,
            (_, Some(mode)) => mode,
            _ => ConversationMode::Ordering,
        }
    }
}

/// Per-conversation aggregate, read-modify-written once per turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMemory {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub customer_id: Option<CustomerId>,
    pub state: ConversationState,
    #[serde(default)]
    pub state_history: Vec<StateTransition>,
    pub cart: Option<Cart>,
    pub pending_confirmation: Option<PendingConfirmation>,
    #[serde(default)]
    pub context: TurnContext,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionMemory {
    pub fn new(
        session_id: SessionId,
        workspace_id: WorkspaceId,
        customer_id: Option<CustomerId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            workspace_id,
            customer_id,
            state: ConversationState::Idle,
            state_history: Vec::new(),
            cart: None,
            pending_confirmation: None,
            context: TurnContext::default(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn machine(&self) -> StateMachine {
        StateMachine::with_history(self.state, self.state_history.clone())
    }

    /// Moves through the state machine; invalid targets are logged and ignored.
    pub fn transition(&mut self, to: ConversationState) -> bool {
        if self.state == to {
            return true;
        }
        let mut machine = self.machine();
        let applied = machine.transition(to);
        let (state, history) = machine.into_parts();
        self.state = state;
        self.state_history = history;
        applied
    }

    /// Walks to `to` through an intermediate phase when no direct edge exists,
    /// e.g. DONE -> COLLECTING_ORDER -> AWAITING_CONFIRMATION.
    pub fn transition_via(&mut self, via: ConversationState, to: ConversationState) -> bool {
        if self.state == to || self.machine().can_transition(to) {
            return self.transition(to);
        }
        self.transition(via) && self.transition(to)
    }

    pub fn cart(&self) -> Cart {
        self.cart.clone().unwrap_or_default()
    }

    pub fn cart_mut(&mut self) -> &mut Cart {
        self.cart.get_or_insert_with(Cart::default)
    }

    pub fn has_items(&self) -> bool {
        self.cart.as_ref().is_some_and(|cart| !cart.is_empty())
    }

    pub fn is_handoff(&self) -> bool {
        self.state == ConversationState::Handoff
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        ActiveSubflow, ConversationMode, SessionId, SessionMemory, TurnContext, WorkspaceId,
    };
    use crate::flows::ConversationState;

    fn memory() -> SessionMemory {
        SessionMemory::new(
            SessionId("sess-1".to_owned()),
            WorkspaceId("ws-1".to_owned()),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn new_session_starts_idle_with_empty_context() {
        let memory = memory();
        assert_eq!(memory.state, ConversationState::Idle);
        assert!(memory.cart.is_none());
        assert!(!memory.has_items());
        assert_eq!(memory.context, TurnContext::default());
    }

    #[test]
    fn transition_records_history_and_rejects_invalid_targets() {
        let mut memory = memory();
        assert!(memory.transition(ConversationState::CollectingOrder));
        assert!(!memory.transition(ConversationState::Done));
        assert_eq!(memory.state, ConversationState::CollectingOrder);
        assert_eq!(memory.state_history.len(), 1);
    }

    #[test]
    fn transition_via_walks_through_intermediate_state() {
        let mut memory = memory();
        memory.state = ConversationState::Done;
        assert!(memory.transition_via(
            ConversationState::CollectingOrder,
            ConversationState::AwaitingConfirmation
        ));
        assert_eq!(memory.state, ConversationState::AwaitingConfirmation);
        assert_eq!(memory.state_history.len(), 2);
    }

    #[test]
    fn payment_subflow_forces_payment_mode() {
        let mut context = TurnContext {
            mode_hint: Some(ConversationMode::Informational),
            ..TurnContext::default()
        };
        assert_eq!(context.mode(), ConversationMode::Informational);

        context.subflow = Some(ActiveSubflow::Payment {
            order_id: "ORD-1".to_owned(),
            stage: super::PaymentStage::ChoosingMethod,
        });
        assert_eq!(context.mode(), ConversationMode::Payment);
    }

    #[test]
    fn subflow_serializes_with_kind_tag() {
        let subflow =
            ActiveSubflow::OrderSelection { tool_name: "cancel_order".to_owned(), options: vec![] };
        let json = serde_json::to_value(&subflow).expect("serialize");
        assert_eq!(json["kind"], "order_selection");
        let back: ActiveSubflow = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.kind(), "order_selection");
    }
}
