use serde::{Deserialize, Serialize};

pub const MAX_QUICK_REPLIES: usize = 3;
pub const MAX_LIST_ITEMS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

/// Channel-neutral reply; the outbound channel decides how to render it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundReply {
    Text { body: String },
    QuickReplies { body: String, options: Vec<QuickReply> },
    List { body: String, button_label: String, items: Vec<ListItem> },
}

impl OutboundReply {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Quick replies beyond the channel limit are dropped.
    pub fn quick_replies(body: impl Into<String>, options: Vec<QuickReply>) -> Self {
        let mut options = options;
        options.truncate(MAX_QUICK_REPLIES);
        Self::QuickReplies { body: body.into(), options }
    }

    pub fn confirm_cancel(body: impl Into<String>) -> Self {
        Self::quick_replies(
            body,
            vec![
                QuickReply { id: "yes".to_owned(), title: "Confirm".to_owned() },
                QuickReply { id: "no".to_owned(), title: "Cancel".to_owned() },
            ],
        )
    }

    pub fn list(
        body: impl Into<String>,
        button_label: impl Into<String>,
        items: Vec<ListItem>,
    ) -> Self {
        let mut items = items;
        items.truncate(MAX_LIST_ITEMS);
        Self::List { body: body.into(), button_label: button_label.into(), items }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Text { body } | Self::QuickReplies { body, .. } | Self::List { body, .. } => body,
        }
    }

    /// Plain-text rendering for channels without interactive widgets.
    pub fn fallback_text(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::QuickReplies { body, options } => {
                let choices: Vec<_> = options.iter().map(|option| option.title.as_str()).collect();
                format!("{body}\n[{}]", choices.join(" / "))
            }
            Self::List { body, items, .. } => {
                let mut lines = vec![body.clone()];
                lines.extend(
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, item)| format!("{}. {}", index + 1, item.title)),
                );
                lines.join("\n")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ListItem, OutboundReply, QuickReply, MAX_LIST_ITEMS};

    #[test]
    fn quick_replies_are_capped_at_three() {
        let options = (0..5)
            .map(|index| QuickReply { id: index.to_string(), title: format!("Option {index}") })
            .collect();
        let OutboundReply::QuickReplies { options, .. } =
            OutboundReply::quick_replies("Pick", options)
        else {
            panic!("expected quick replies");
        };
        assert_eq!(options.len(), 3);
    }

    #[test]
    fn list_is_capped_and_renders_numbered_fallback() {
        let items = (0..12)
            .map(|index| ListItem {
                id: index.to_string(),
                title: format!("Item {index}"),
                description: None,
            })
            .collect();
        let reply = OutboundReply::list("Which one?", "Choose", items);
        let text = reply.fallback_text();
        assert!(text.starts_with("Which one?\n1. Item 0"));
        assert_eq!(text.lines().count(), MAX_LIST_ITEMS + 1);
    }

    #[test]
    fn confirm_cancel_renders_both_choices() {
        let reply = OutboundReply::confirm_cancel("Place this order?");
        assert_eq!(reply.body(), "Place this order?");
        assert_eq!(reply.fallback_text(), "Place this order?\n[Confirm / Cancel]");
    }
}
