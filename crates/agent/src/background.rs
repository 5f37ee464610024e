//! Post-order enrichment runs on its own tokio task. Failures are sent down an
//! explicit channel that the server drains, so none of them are lost.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_core::domain::session::{CustomerId, SessionId, WorkspaceId};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct EnrichmentError(pub String);

#[derive(Clone, Debug, PartialEq)]
pub struct EnrichmentJob {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub customer_id: Option<CustomerId>,
    pub correlation_id: String,
    pub order: Value,
}

#[derive(Debug)]
pub struct EnrichmentFailure {
    pub job: EnrichmentJob,
    pub error: EnrichmentError,
}

/// Updates long-lived customer memory (preferences, usual orders) after an
/// order completes.
#[async_trait]
pub trait MemoryEnricher: Send + Sync {
    async fn enrich(&self, job: &EnrichmentJob) -> Result<(), EnrichmentError>;
}

/// Records the completed order in the log stream.
#[derive(Clone, Debug, Default)]
pub struct LoggingEnricher;

#[async_trait]
impl MemoryEnricher for LoggingEnricher {
    async fn enrich(&self, job: &EnrichmentJob) -> Result<(), EnrichmentError> {
        tracing::info!(
            event_name = "enrichment.order_recorded",
            session_id = %job.session_id.0,
            workspace_id = %job.workspace_id.0,
            correlation_id = %job.correlation_id,
            order = %job.order,
            "order recorded for customer memory"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct BackgroundEnrichment {
    enricher: Arc<dyn MemoryEnricher>,
    failures: mpsc::UnboundedSender<EnrichmentFailure>,
}

impl BackgroundEnrichment {
    /// Returns the spawner and the receiving end of its failure channel.
    pub fn new(
        enricher: Arc<dyn MemoryEnricher>,
    ) -> (Self, mpsc::UnboundedReceiver<EnrichmentFailure>) {
        let (failures, receiver) = mpsc::unbounded_channel();
        (Self { enricher, failures }, receiver)
    }

    pub fn spawn(&self, job: EnrichmentJob) -> JoinHandle<()> {
        let enricher = Arc::clone(&self.enricher);
        let failures = self.failures.clone();
        tokio::spawn(async move {
            if let Err(error) = enricher.enrich(&job).await {
                if let Err(unsent) = failures.send(EnrichmentFailure { job, error }) {
                    tracing::error!(
                        event_name = "enrichment.failure_dropped",
                        session_id = %unsent.0.job.session_id.0,
                        error = %unsent.0.error,
                        "enrichment failure channel closed"
                    );
                }
            }
        })
    }
}

/// Logs every failure until all senders are gone.
pub async fn drain_failures(mut receiver: mpsc::UnboundedReceiver<EnrichmentFailure>) -> usize {
    let mut drained = 0;
    while let Some(failure) = receiver.recv().await {
        drained += 1;
        tracing::warn!(
            event_name = "enrichment.failed",
            session_id = %failure.job.session_id.0,
            correlation_id = %failure.job.correlation_id,
            error = %failure.error,
            "background enrichment failed"
        );
    }
    drained
}
