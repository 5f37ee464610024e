use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::session::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: SessionId,
    /// Upstream id; duplicates of the same id are stored once.
    pub external_id: String,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn plain_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn tool_use_ids(&self) -> HashSet<String> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn tool_result_ids(&self) -> HashSet<String> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Keeps the newest `window` messages and removes tool traffic that lost its
/// partner: a result whose call fell outside the window, or a call that never
/// got a result. The returned history starts with a plain user message.
pub fn trim_history(messages: &[StoredMessage], window: usize) -> Vec<StoredMessage> {
    let start = messages.len().saturating_sub(window);
    let mut kept: Vec<StoredMessage> = messages[start..].to_vec();

    for index in 0..kept.len() {
        let calls = kept[index].tool_use_ids();
        if !calls.is_empty() {
            let answered =
                kept.get(index + 1).map(StoredMessage::tool_result_ids).unwrap_or_default();
            kept[index].content.retain(|block| match block {
                ContentBlock::ToolUse { id, .. } => answered.contains(id),
                _ => true,
            });
        }

        let results = kept[index].tool_result_ids();
        if !results.is_empty() {
            let asked = match index.checked_sub(1) {
                Some(previous) => kept[previous].tool_use_ids(),
                None => HashSet::new(),
            };
            kept[index].content.retain(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => asked.contains(tool_use_id),
                _ => true,
            });
        }
    }

    kept.retain(|message| !message.content.is_empty());
    let first_user = kept.iter().position(|message| message.role == MessageRole::User);
    match first_user {
        Some(position) => kept.split_off(position),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{trim_history, ContentBlock, MessageRole, StoredMessage};
    use crate::domain::session::SessionId;

    fn message(id: &str, role: MessageRole, content: Vec<ContentBlock>) -> StoredMessage {
        StoredMessage {
            session_id: SessionId("sess".to_owned()),
            external_id: id.to_owned(),
            role,
            content,
            created_at: Utc::now(),
        }
    }

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse { id: id.to_owned(), name: "view_cart".to_owned(), input: json!({}) }
    }

    fn tool_result(id: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.to_owned(),
            content: "{}".to_owned(),
            is_error: false,
        }
    }

    #[test]
    fn window_cut_drops_orphan_tool_result_at_head() {
        let history = vec![
            message("1", MessageRole::User, vec![ContentBlock::text("what's in my cart")]),
            message("2", MessageRole::Assistant, vec![tool_use("t1")]),
            message("3", MessageRole::User, vec![tool_result("t1")]),
            message("4", MessageRole::Assistant, vec![ContentBlock::text("2 sodas")]),
            message("5", MessageRole::User, vec![ContentBlock::text("thanks")]),
        ];

        let trimmed = trim_history(&history, 3);
        let ids: Vec<_> = trimmed.iter().map(|message| message.external_id.as_str()).collect();
        assert_eq!(ids, vec!["5"]);
    }

    #[test]
    fn paired_tool_traffic_survives_trimming() {
        let history = vec![
            message("1", MessageRole::User, vec![ContentBlock::text("what's in my cart")]),
            message(
                "2",
                MessageRole::Assistant,
                vec![ContentBlock::text("checking"), tool_use("t1")],
            ),
            message("3", MessageRole::User, vec![tool_result("t1")]),
            message("4", MessageRole::Assistant, vec![ContentBlock::text("2 sodas")]),
        ];

        let trimmed = trim_history(&history, 10);
        assert_eq!(trimmed.len(), 4);
        assert_eq!(trimmed[1].content.len(), 2);
    }

    #[test]
    fn unanswered_tool_use_is_stripped() {
        let history = vec![
            message("1", MessageRole::User, vec![ContentBlock::text("cancel ORD-7")]),
            message(
                "2",
                MessageRole::Assistant,
                vec![ContentBlock::text("Please confirm."), tool_use("t9")],
            ),
        ];

        let trimmed = trim_history(&history, 10);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[1].content, vec![ContentBlock::text("Please confirm.")]);
    }

    #[test]
    fn plain_text_joins_text_blocks_only() {
        let stored = message(
            "1",
            MessageRole::Assistant,
            vec![ContentBlock::text("a"), tool_use("t"), ContentBlock::text("b")],
        );
        assert_eq!(stored.plain_text(), "a\nb");
    }
}
