use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::config::IngestionConfig;

use crate::pipeline::{IngestionPipeline, PipelineError, ProcessOutcome};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPolicy {
    pub worker_count: usize,
    pub poll_interval: Duration,
    /// Rows fetched per poll.
    pub claim_limit: usize,
    pub error_base_delay_ms: u64,
    pub error_max_delay_ms: u64,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
            claim_limit: 10,
            error_base_delay_ms: 250,
            error_max_delay_ms: 5_000,
        }
    }
}

impl WorkerPolicy {
    pub fn from_config(config: &IngestionConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            ..Self::default()
        }
    }

    fn backoff(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms =
            self.error_base_delay_ms.saturating_mul(multiplier).min(self.error_max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Polls the inbound ledger and feeds claimable events through the pipeline.
/// Stops when the shutdown channel flips to `true` or its sender is dropped.
pub struct WorkerPool {
    pipeline: Arc<IngestionPipeline>,
    policy: WorkerPolicy,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<IngestionPipeline>, policy: WorkerPolicy) -> Self {
        Self { pipeline, policy }
    }

    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.policy.worker_count.max(1))
            .map(|index| {
                let worker = Worker {
                    id: format!("worker-{}-{}", std::process::id(), index + 1),
                    pipeline: Arc::clone(&self.pipeline),
                    policy: self.policy.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}

struct Worker {
    id: String,
    pipeline: Arc<IngestionPipeline>,
    policy: WorkerPolicy,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(event_name = "worker.started", worker_id = %self.id, "ingestion worker started");
        let mut consecutive_errors = 0_u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.poll_once().await {
                Ok(0) => {
                    consecutive_errors = 0;
                    self.policy.poll_interval
                }
                Ok(processed) => {
                    consecutive_errors = 0;
                    debug!(worker_id = %self.id, processed, "worker poll handled events");
                    Duration::ZERO
                }
                Err(error) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        event_name = "worker.poll_failed",
                        worker_id = %self.id,
                        consecutive_errors,
                        error = %error,
                        "worker poll failed; backing off"
                    );
                    self.policy.backoff(consecutive_errors)
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(event_name = "worker.stopped", worker_id = %self.id, "ingestion worker stopped");
    }

    /// Returns how many events this poll actually moved.
    async fn poll_once(&self) -> Result<usize, PipelineError> {
        let claimable = self.pipeline.claimable(self.policy.claim_limit).await?;
        let mut processed = 0;
        for record in claimable {
            match self.pipeline.process(&record.correlation_id, &self.id).await {
                Ok(ProcessOutcome::Skipped) => {}
                Ok(_) => processed += 1,
                Err(error) => {
                    warn!(
                        event_name = "worker.process_failed",
                        worker_id = %self.id,
                        correlation_id = %record.correlation_id.0,
                        error = %error,
                        "processing an inbound event failed"
                    );
                }
            }
        }
        Ok(processed)
    }
}
