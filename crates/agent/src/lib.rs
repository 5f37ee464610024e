//! Conversation runtime for chat ordering.
//!
//! A turn is handled deterministically whenever possible: pending
//! confirmations, product/order pickers, shortage questions, checkout and
//! plain order lists never reach the reasoning service. Everything else goes
//! through a bounded tool loop whose calls are checked by [`guardrails`]
//! before they touch the session.
//!
//! Prices and stock always come from the catalog snapshot. The reasoning
//! service can ask for cart changes but cannot set an amount.

pub mod background;
pub mod guardrails;
pub mod llm;
pub mod quick_parse;
pub mod runtime;
pub mod tools;

pub use background::{BackgroundEnrichment, EnrichmentJob, LoggingEnricher, MemoryEnricher};
pub use guardrails::{GuardrailDecision, GuardrailPolicy};
pub use llm::{client_from_config, ReasoningClient, ReasoningError};
pub use runtime::{
    Orchestrator, OrchestratorSettings, TurnError, TurnInput, TurnLease, TurnOutcome,
    UnboundedLease,
};
pub use tools::{Tool, ToolOutcome, ToolRegistry};
