use chrono::Utc;
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{ConversationState, StateTransition};

pub const MAX_HISTORY: usize = 20;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: ConversationState, to: ConversationState },
}

/// Fixed transition table. HANDOFF is reachable from every other phase and
/// only leaves through an explicit release back to IDLE.
pub fn is_allowed(from: ConversationState, to: ConversationState) -> bool {
    use ConversationState::{
        AwaitingConfirmation, CollectingOrder, Done, Executing, Handoff, Idle, NeedsDetails,
    };

    match (from, to) {
        (Handoff, Idle) => true,
        (Handoff, _) => false,
        (_, Handoff) => true,
        (Idle, CollectingOrder | NeedsDetails | AwaitingConfirmation) => true,
        (CollectingOrder, NeedsDetails | AwaitingConfirmation | Idle) => true,
        (NeedsDetails, CollectingOrder | AwaitingConfirmation | Idle) => true,
        (AwaitingConfirmation, Executing | CollectingOrder | Idle) => true,
        (Executing, Done | Idle) => true,
        (Done, Idle | CollectingOrder) => true,
        _ => false,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateMachine {
    state: ConversationState,
    history: Vec<StateTransition>,
}

impl StateMachine {
    pub fn new(state: ConversationState) -> Self {
        Self { state, history: Vec::new() }
    }

    pub fn with_history(state: ConversationState, history: Vec<StateTransition>) -> Self {
        Self { state, history }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn into_parts(self) -> (ConversationState, Vec<StateTransition>) {
        (self.state, self.history)
    }

    pub fn can_transition(&self, to: ConversationState) -> bool {
        is_allowed(self.state, to)
    }

    pub fn try_transition(
        &mut self,
        to: ConversationState,
    ) -> Result<StateTransition, FlowTransitionError> {
        if !self.can_transition(to) {
            return Err(FlowTransitionError::InvalidTransition { from: self.state, to });
        }

        let record = StateTransition { from: self.state, to, at: Utc::now() };
        self.state = to;
        self.history.push(record.clone());
        if self.history.len() > MAX_HISTORY {
            let overflow = self.history.len() - MAX_HISTORY;
            self.history.drain(..overflow);
        }
        Ok(record)
    }

    /// Applies `to` when the table allows it. Invalid requests are logged and
    /// leave the current state untouched.
    pub fn transition(&mut self, to: ConversationState) -> bool {
        match self.try_transition(to) {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(
                    event_name = "flow.transition_rejected",
                    from = %self.state,
                    to = %to,
                    error = %error,
                    "ignoring invalid conversation transition"
                );
                false
            }
        }
    }

    pub fn transition_with_audit<S>(
        &mut self,
        to: ConversationState,
        sink: &S,
        audit: &AuditContext,
    ) -> bool
    where
        S: AuditSink + ?Sized,
    {
        let from = self.state;
        let applied = self.transition(to);
        let (event_type, outcome) = if applied {
            ("flow.transition_applied", AuditOutcome::Success)
        } else {
            ("flow.transition_rejected", AuditOutcome::Rejected)
        };
        sink.emit(
            AuditEvent::from_context(audit, event_type, AuditCategory::Flow, outcome)
                .with_metadata("from", from.as_str())
                .with_metadata("to", to.as_str()),
        );
        applied
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
    use crate::flows::machine::{is_allowed, FlowTransitionError, StateMachine, MAX_HISTORY};
    use crate::flows::states::ConversationState::{
        self, AwaitingConfirmation, CollectingOrder, Done, Executing, Handoff, Idle, NeedsDetails,
    };

    const EXPECTED: &[(ConversationState, &[ConversationState])] = &[
        (Idle, &[CollectingOrder, NeedsDetails, AwaitingConfirmation, Handoff]),
        (CollectingOrder, &[NeedsDetails, AwaitingConfirmation, Idle, Handoff]),
        (NeedsDetails, &[CollectingOrder, AwaitingConfirmation, Idle, Handoff]),
        (AwaitingConfirmation, &[Executing, CollectingOrder, Idle, Handoff]),
        (Executing, &[Done, Handoff, Idle]),
        (Done, &[Idle, CollectingOrder, Handoff]),
        (Handoff, &[Idle]),
    ];

    #[test]
    fn transition_table_is_exhaustive_over_every_pair() {
        for (from, allowed) in EXPECTED {
            for to in ConversationState::ALL {
                let mut machine = StateMachine::new(*from);
                let expected = allowed.contains(&to);
                assert_eq!(is_allowed(*from, to), expected, "{from} -> {to}");
                assert_eq!(machine.can_transition(to), expected, "{from} -> {to}");
                assert_eq!(machine.transition(to), expected, "{from} -> {to}");
                let landed = if expected { to } else { *from };
                assert_eq!(machine.state(), landed);
            }
        }
    }

    #[test]
    fn self_transitions_are_rejected() {
        for state in ConversationState::ALL {
            assert!(!is_allowed(state, state), "{state} should not loop onto itself");
        }
    }

    #[test]
    fn invalid_transition_leaves_state_and_history_unchanged() {
        let mut machine = StateMachine::new(Idle);
        assert!(!machine.transition(Executing));
        assert_eq!(machine.state(), Idle);
        assert!(machine.history().is_empty());

        let error = machine.try_transition(Done).expect_err("idle cannot jump to done");
        assert_eq!(error, FlowTransitionError::InvalidTransition { from: Idle, to: Done });
    }

    #[test]
    fn happy_path_records_history_in_order() {
        let mut machine = StateMachine::default();
        for to in [CollectingOrder, AwaitingConfirmation, Executing, Done, Idle] {
            assert!(machine.transition(to));
        }

        let visited: Vec<_> =
            machine.history().iter().map(|entry| (entry.from, entry.to)).collect();
        assert_eq!(
            visited,
            vec![
                (Idle, CollectingOrder),
                (CollectingOrder, AwaitingConfirmation),
                (AwaitingConfirmation, Executing),
                (Executing, Done),
                (Done, Idle),
            ]
        );
    }

    #[test]
    fn handoff_only_releases_to_idle() {
        let mut machine = StateMachine::new(CollectingOrder);
        assert!(machine.transition(Handoff));
        assert!(!machine.transition(CollectingOrder));
        assert!(!machine.transition(AwaitingConfirmation));
        assert!(machine.transition(Idle));
    }

    #[test]
    fn history_is_bounded() {
        let mut machine = StateMachine::default();
        for _ in 0..MAX_HISTORY {
            assert!(machine.transition(CollectingOrder));
            assert!(machine.transition(Idle));
        }
        assert_eq!(machine.history().len(), MAX_HISTORY);
        assert_eq!(machine.history().last().map(|entry| entry.to), Some(Idle));
    }

    #[test]
    fn audited_transition_emits_applied_and_rejected_events() {
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(Some("sess-1".to_owned()), "corr-1", "orchestrator");
        let mut machine = StateMachine::default();

        assert!(machine.transition_with_audit(CollectingOrder, &sink, &audit));
        assert!(!machine.transition_with_audit(Done, &sink, &audit));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "flow.transition_applied");
        assert_eq!(events[0].metadata.get("to").map(String::as_str), Some("COLLECTING_ORDER"));
        assert_eq!(events[1].outcome, AuditOutcome::Rejected);
    }
}
