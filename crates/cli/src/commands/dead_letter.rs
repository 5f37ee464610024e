use parley_core::domain::inbound::CorrelationId;

use crate::commands::{operator_pipeline, with_database, CommandResult};

pub fn list(limit: usize) -> CommandResult {
    with_database("dead_letter.list", |config, pool| async move {
        let pipeline = operator_pipeline(&config, &pool)?;
        let entries = pipeline
            .dead_lettered(limit)
            .await
            .map_err(|error| ("dead_letter_query", error.to_string(), 6u8))?;

        if entries.is_empty() {
            return Ok("dead-letter queue is empty".to_string());
        }
        let lines = entries
            .iter()
            .map(|entry| {
                format!(
                    "  - {} [{}] retries={} error={}",
                    entry.correlation_id.0,
                    entry.conversation_key,
                    entry.retry_count,
                    entry.last_error
                )
            })
            .collect::<Vec<_>>();
        Ok(format!("{} dead-lettered event(s):\n{}", entries.len(), lines.join("\n")))
    })
}

/// Puts the event back on the ledger with a fresh retry budget.
pub fn requeue(correlation_id: &str) -> CommandResult {
    let correlation_id = CorrelationId(correlation_id.to_string());

    with_database("dead_letter.requeue", |config, pool| async move {
        let pipeline = operator_pipeline(&config, &pool)?;
        let requeued = pipeline
            .requeue_dead_letter(&correlation_id)
            .await
            .map_err(|error| ("dead_letter_requeue", error.to_string(), 6u8))?;

        if requeued {
            Ok(format!("event `{}` requeued", correlation_id.0))
        } else {
            Err(("not_found", format!("event `{}` is not dead-lettered", correlation_id.0), 7u8))
        }
    })
}
