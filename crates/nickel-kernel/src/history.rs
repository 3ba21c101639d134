use nickel_contracts::{ConversationTurn, Role};
use serde_json::Value;

/// Keeps well-formed user/assistant turns and silently drops everything else.
pub fn sanitize_history(raw: Option<&Value>) -> Vec<ConversationTurn> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let role = match item.get("role").and_then(|v| v.as_str()) {
                Some("user") => Role::User,
                Some("assistant") => Role::Assistant,
                _ => return None,
            };
            let content = item.get("content").and_then(|v| v.as_str())?.trim();
            if content.is_empty() {
                return None;
            }
            Some(ConversationTurn {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}

/// The most recent `window` turns, in their original order.
pub fn history_window(turns: &[ConversationTurn], window: usize) -> &[ConversationTurn] {
    &turns[turns.len().saturating_sub(window)..]
}
