pub mod audit;
pub mod config;
pub mod confirmation;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod ingestion_engine;
pub mod matcher;
pub mod text;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use confirmation::{parse_reply, ConfirmationGate};
pub use domain::cart::{Cart, CartItem};
pub use domain::catalog::{ProductCandidate, ProductId, VariantId};
pub use domain::inbound::{ConversationKey, CorrelationId, InboundEventRecord, InboundStatus};
pub use domain::reply::OutboundReply;
pub use domain::session::{ConversationMode, SessionId, SessionMemory, WorkspaceId};
pub use errors::InterfaceError;
pub use flows::{ConversationState, StateMachine};
pub use ingestion_engine::DeterministicIngestionEngine;
pub use matcher::{MatchResult, ProductMatcher};
