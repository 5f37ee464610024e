pub mod machine;
pub mod states;

pub use machine::{is_allowed, FlowTransitionError, StateMachine};
pub use states::{ConversationState, StateTransition};
