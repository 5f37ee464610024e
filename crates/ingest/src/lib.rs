//! Inbound message ingestion for parley.
//!
//! Channel adapters post [`InboundEnvelope`]s to the server, which records
//! them in a durable ledger keyed by correlation id. A [`WorkerPool`] claims
//! pending events, takes the per-conversation lock, waits out the coalescing
//! window so bursts of short messages become one turn, runs the orchestrator
//! and delivers the reply through an [`OutboundChannel`].
//!
//! ```text
//! POST /v1/inbound -> ingest() -> inbound_event (pending)
//!                                     |
//!                          WorkerPool -> process() -> Orchestrator -> OutboundChannel
//!                                     |
//!                         failed (backoff) / dlq -> handoff
//! ```

mod operator;
pub mod events;
pub mod outbound;
pub mod pipeline;
pub mod signature;
pub mod worker;

pub use events::{EnvelopeError, InboundEnvelope, InboundPayload};
pub use outbound::{
    DeliveryError, NoopOutboundChannel, OutboundChannel, RecordingOutboundChannel,
    WebhookOutboundChannel,
};
pub use pipeline::{
    engine_from_config, IngestOutcome, IngestionPipeline, PipelineError, PipelineRepositories,
    PipelineSettings, ProcessOutcome,
};
pub use signature::{SignatureError, SignatureVerifier, SIGNATURE_HEADER};
pub use worker::{WorkerPolicy, WorkerPool};
