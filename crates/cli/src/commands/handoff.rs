use parley_core::domain::inbound::ConversationKey;

use crate::commands::{operator_pipeline, with_database, CommandResult};

pub fn list() -> CommandResult {
    with_database("handoff.list", |config, pool| async move {
        let pipeline = operator_pipeline(&config, &pool)?;
        let handoffs = pipeline
            .handoffs()
            .await
            .map_err(|error| ("handoff_query", error.to_string(), 6u8))?;

        if handoffs.is_empty() {
            return Ok("no conversations are waiting for a human".to_string());
        }
        let lines = handoffs
            .iter()
            .map(|conversation| {
                format!(
                    "  - {} ({}, since {})",
                    conversation.conversation_key,
                    conversation.handoff_reason.as_deref().unwrap_or("no reason recorded"),
                    conversation.updated_at.to_rfc3339()
                )
            })
            .collect::<Vec<_>>();
        Ok(format!("{} conversation(s) in handoff:\n{}", handoffs.len(), lines.join("\n")))
    })
}

/// Hands the conversation back to the agent.
pub fn release(workspace: &str, channel: &str, sender: &str) -> CommandResult {
    let key = ConversationKey::new(workspace, channel, sender);

    with_database("handoff.release", |config, pool| async move {
        let pipeline = operator_pipeline(&config, &pool)?;
        let released = pipeline
            .release_handoff(&key)
            .await
            .map_err(|error| ("handoff_release", error.to_string(), 6u8))?;

        if released {
            Ok(format!("conversation `{key}` returned to the agent"))
        } else {
            Err(("not_in_handoff", format!("conversation `{key}` is not in handoff"), 7u8))
        }
    })
}
