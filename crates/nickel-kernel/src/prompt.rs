use nickel_contracts::{ConversationTurn, ToolAccess, ToolId, TOOL_CATALOG};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::history::history_window;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Nickel, an adult, pragmatic personal assistant.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// Tools travel as function definitions next to the messages, with a
    /// strict response schema for plain answers.
    FunctionCalling,
    /// Tools are spelled out in the system prompt and the model answers with a
    /// free JSON object. Accepted by endpoints that reject the above.
    PromptJson,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub fn tool_documentation() -> String {
    let mut doc = String::from("Tools available:\n");
    for spec in TOOL_CATALOG {
        let access = match (spec.access, spec.requires_confirmation) {
            (ToolAccess::Read, _) => "read",
            (ToolAccess::Write, true) => "write, confirmation",
            (ToolAccess::Write, false) => "write",
        };
        doc.push_str(&format!("- {} ({access}): payload {}\n", spec.id, spec.payload));
    }
    doc
}

/// System prompt, then the history window, then the new user message.
pub fn build_messages(
    system_prompt: &str,
    user_message: &str,
    forced_tool: Option<ToolId>,
    history: &[ConversationTurn],
    window: usize,
    style: PromptStyle,
) -> Vec<PromptMessage> {
    let mut instructions = match style {
        PromptStyle::PromptJson => format!(
            "{}Return ONLY valid JSON with keys: response (string), action (object or null).\n\
             If action is used, include tool and payload fields.\n\
             Do not include markdown or commentary outside JSON.",
            tool_documentation()
        ),
        PromptStyle::FunctionCalling => format!(
            "{}Call at most one function when an action is needed. \
             Otherwise answer with JSON keys: response (string), action (null). \
             If action is used in JSON, payload is the object encoded as a string.",
            tool_documentation()
        ),
    };
    if let Some(tool) = forced_tool {
        instructions.push_str(&format!(
            "\nUse tool: {tool}. Do not choose a different tool."
        ));
    }

    let mut messages = vec![PromptMessage::new(
        "system",
        format!("{system_prompt}\n\n{instructions}"),
    )];
    for turn in history_window(history, window) {
        messages.push(PromptMessage::new(turn.role.as_str(), turn.content.clone()));
    }
    messages.push(PromptMessage::new("user", user_message));
    messages
}

pub fn function_tools() -> Vec<Value> {
    TOOL_CATALOG
        .iter()
        .map(|spec| {
            json!({
                "type": "function",
                "function": {
                    "name": spec.id.function_name(),
                    "description": format!("{} payload {}", spec.id, spec.payload),
                    "parameters": {
                        "type": "object",
                        "additionalProperties": true
                    }
                }
            })
        })
        .collect()
}

pub fn tool_choice(forced_tool: Option<ToolId>) -> Value {
    match forced_tool {
        Some(tool) => json!({
            "type": "function",
            "function": {"name": tool.function_name()}
        }),
        None => json!("auto"),
    }
}

/// Strict mode closes every object, so the open payload travels as an
/// encoded JSON object.
pub fn reply_json_schema() -> Value {
    let tool_ids: Vec<&str> = TOOL_CATALOG.iter().map(|s| s.id.as_str()).collect();
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "assistant_reply",
            "strict": true,
            "schema": {
                "type": "object",
                "additionalProperties": false,
                "required": ["response", "action"],
                "properties": {
                    "response": {"type": "string"},
                    "action": {
                        "anyOf": [
                            {"type": "null"},
                            {
                                "type": "object",
                                "additionalProperties": false,
                                "required": ["tool", "payload"],
                                "properties": {
                                    "tool": {"type": "string", "enum": tool_ids},
                                    "payload": {
                                        "type": "string",
                                        "description": "JSON object with the tool arguments"
                                    }
                                }
                            }
                        ]
                    }
                }
            }
        }
    })
}

pub fn json_object_format() -> Value {
    json!({"type": "json_object"})
}
