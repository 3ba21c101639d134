use nickel_contracts::{ModelAction, ModelReply};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("model reply is empty")]
    Empty,
    #[error("model reply does not contain a JSON object")]
    NoObject,
    #[error("model reply has an invalid shape: {0}")]
    InvalidShape(String),
    #[error("model tool call is malformed: {0}")]
    MalformedToolCall(String),
}

/// Decodes message content, which is either a string or a list of parts.
pub fn decode(raw: &Value) -> Result<ModelReply, DecodeError> {
    match raw {
        Value::String(text) => decode_text(text),
        Value::Array(parts) => decode_text(&concat_text_parts(parts)),
        Value::Object(object) => reply_from_object(object.clone()),
        Value::Null => Err(DecodeError::Empty),
        _ => Err(DecodeError::NoObject),
    }
}

/// Plain JSON, then fenced code blocks, then the outermost braces.
pub fn decode_text(text: &str) -> Result<ModelReply, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    if let Some(object) = parse_object(trimmed) {
        return reply_from_object(object);
    }
    for block in fenced_blocks(trimmed) {
        if let Some(object) = parse_object(block) {
            return reply_from_object(object);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Some(object) = parse_object(&trimmed[start..=end]) {
                return reply_from_object(object);
            }
        }
    }
    Err(DecodeError::NoObject)
}

/// Content wins when present; otherwise the first structured tool call is used.
pub fn decode_choice(message: &Value) -> Result<ModelReply, DecodeError> {
    match message.get("content") {
        Some(content) if has_content(content) => decode(content),
        _ => decode_tool_call(message),
    }
}

/// Like [`decode_choice`], but a content decode failure still falls through
/// to the tool-call path before giving up.
pub fn decode_message(message: &Value) -> Result<ModelReply, DecodeError> {
    match message.get("content") {
        Some(content) if has_content(content) => {
            decode(content).or_else(|primary| decode_tool_call(message).map_err(|_| primary))
        }
        _ => decode_tool_call(message),
    }
}

pub fn decode_tool_call(message: &Value) -> Result<ModelReply, DecodeError> {
    let call = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .and_then(|calls| calls.first())
        .or_else(|| message.get("function_call"))
        .ok_or(DecodeError::NoObject)?;
    let function = call.get("function").unwrap_or(call);

    let name = function
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DecodeError::MalformedToolCall("missing function name".to_string()))?;

    let payload = match function.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(encoded)) => parse_encoded_object(encoded)
            .map_err(|why| DecodeError::MalformedToolCall(format!("arguments are {why}")))?,
        Some(_) => {
            return Err(DecodeError::MalformedToolCall(
                "arguments are not an object".to_string(),
            ))
        }
    };

    Ok(ModelReply {
        response: String::new(),
        action: Some(ModelAction {
            tool: name.to_string(),
            payload,
        }),
    })
}

fn has_content(content: &Value) -> bool {
    match content {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        Value::Array(parts) => !parts.is_empty(),
        _ => true,
    }
}

fn concat_text_parts(parts: &[Value]) -> String {
    let mut text = String::new();
    for part in parts {
        match part {
            Value::String(s) => text.push_str(s),
            Value::Object(obj) => {
                if let Some(s) = obj.get("text").and_then(|v| v.as_str()) {
                    text.push_str(s);
                }
            }
            _ => {}
        }
    }
    text
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Inner text of each ``` block, with the language tag line skipped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let body_start = match after_open.find('\n') {
            Some(nl) if !after_open[..nl].contains('{') => nl + 1,
            _ => 0,
        };
        let body = &after_open[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

fn reply_from_object(mut object: Map<String, Value>) -> Result<ModelReply, DecodeError> {
    let response = match object.remove("response") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(_) => {
            return Err(DecodeError::InvalidShape(
                "response must be a string".to_string(),
            ))
        }
    };

    let action = match object.remove("action") {
        None | Some(Value::Null) => None,
        Some(Value::Object(mut action)) => {
            let tool = match action.remove("tool") {
                Some(Value::String(tool)) if !tool.trim().is_empty() => tool.trim().to_string(),
                _ => {
                    return Err(DecodeError::InvalidShape(
                        "action.tool must be a non-empty string".to_string(),
                    ))
                }
            };
            let payload = match action.remove("payload") {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(payload)) => payload,
                // Strict response schemas carry the payload as an encoded object.
                Some(Value::String(encoded)) => parse_encoded_object(&encoded)
                    .map_err(|why| DecodeError::InvalidShape(format!("action.payload is {why}")))?,
                Some(_) => {
                    return Err(DecodeError::InvalidShape(
                        "action.payload must be an object".to_string(),
                    ))
                }
            };
            Some(ModelAction { tool, payload })
        }
        Some(_) => {
            return Err(DecodeError::InvalidShape(
                "action must be an object or null".to_string(),
            ))
        }
    };

    Ok(ModelReply { response, action })
}

/// Blank text is an empty object; anything else must decode to an object.
fn parse_encoded_object(encoded: &str) -> Result<Map<String, Value>, String> {
    if encoded.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(encoded) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("not an object".to_string()),
        Err(e) => Err(format!("not valid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_reply() -> ModelReply {
        ModelReply {
            response: "ok".to_string(),
            action: None,
        }
    }

    #[test]
    fn parses_plain_json() {
        let decoded = decode_text(r#"{"response":"ok","action":null}"#).unwrap();
        assert_eq!(decoded, ok_reply());
    }

    #[test]
    fn parses_markdown_fence() {
        let decoded = decode_text("```json\n{\"response\":\"ok\",\"action\":null}\n```").unwrap();
        assert_eq!(decoded, ok_reply());
    }

    #[test]
    fn parses_fence_without_language_tag() {
        let decoded =
            decode_text("Segue:\n```\n{\"response\":\"ok\",\"action\":null}\n```\nfim").unwrap();
        assert_eq!(decoded, ok_reply());
    }

    #[test]
    fn parses_prefixed_text() {
        let decoded = decode_text(r#"Aqui está: {"response":"ok","action":null}"#).unwrap();
        assert_eq!(decoded, ok_reply());
    }

    #[test]
    fn parses_content_parts() {
        let decoded = decode(&json!([
            {"type": "text", "text": "{\"response\":\"ok\","},
            {"type": "image_url", "image_url": {"url": "x"}},
            {"type": "text", "text": "\"action\":null}"}
        ]))
        .unwrap();
        assert_eq!(decoded, ok_reply());
    }

    #[test]
    fn canonical_reply_round_trips() {
        let mut payload = Map::new();
        payload.insert("raw_base64".to_string(), json!("abc"));
        let reply = ModelReply {
            response: "Vou enviar.".to_string(),
            action: Some(ModelAction {
                tool: "email.send".to_string(),
                payload,
            }),
        };
        let text = serde_json::to_string(&reply).unwrap();
        assert_eq!(decode_text(&text).unwrap(), reply);
    }

    #[test]
    fn rejects_non_object_values() {
        assert_eq!(decode_text("[1,2,3]"), Err(DecodeError::NoObject));
        assert_eq!(decode_text("\"just text\""), Err(DecodeError::NoObject));
        assert_eq!(decode_text("sem json aqui"), Err(DecodeError::NoObject));
        assert_eq!(decode_text("   "), Err(DecodeError::Empty));
    }

    #[test]
    fn rejects_action_without_tool() {
        let err = decode_text(r#"{"response":"x","action":{"payload":{}}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidShape(_)));
    }

    #[test]
    fn choice_prefers_content() {
        let message = json!({
            "content": "{\"response\":\"ok\",\"action\":null}",
            "tool_calls": [{"function": {"name": "email_send", "arguments": "{}"}}]
        });
        assert_eq!(decode_choice(&message).unwrap(), ok_reply());
    }

    #[test]
    fn choice_reads_tool_call_with_encoded_arguments() {
        let message = json!({
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "email_send", "arguments": "{\"raw_base64\":\"abc\"}"}
            }]
        });
        let reply = decode_choice(&message).unwrap();
        assert_eq!(reply.response, "");
        let action = reply.action.unwrap();
        assert_eq!(action.tool, "email_send");
        assert_eq!(action.payload.get("raw_base64"), Some(&json!("abc")));
    }

    #[test]
    fn choice_reads_tool_call_with_object_arguments() {
        let message = json!({
            "tool_calls": [{"function": {"name": "spotify.pause", "arguments": {"device": "phone"}}}]
        });
        let action = decode_choice(&message).unwrap().action.unwrap();
        assert_eq!(action.tool, "spotify.pause");
        assert_eq!(action.payload.get("device"), Some(&json!("phone")));
    }

    #[test]
    fn malformed_tool_calls_fail() {
        let missing_name = json!({"tool_calls": [{"function": {"arguments": "{}"}}]});
        assert!(matches!(
            decode_choice(&missing_name),
            Err(DecodeError::MalformedToolCall(_))
        ));

        let array_args = json!({"tool_calls": [{"function": {"name": "tasks_list", "arguments": "[1]"}}]});
        assert!(matches!(
            decode_choice(&array_args),
            Err(DecodeError::MalformedToolCall(_))
        ));

        let numeric_args = json!({"tool_calls": [{"function": {"name": "tasks_list", "arguments": 3}}]});
        assert!(matches!(
            decode_choice(&numeric_args),
            Err(DecodeError::MalformedToolCall(_))
        ));

        assert_eq!(decode_choice(&json!({"content": null})), Err(DecodeError::NoObject));
    }

    #[test]
    fn encoded_payload_from_strict_schema_is_unpacked() {
        let reply = decode_text(
            r#"{"response":"","action":{"tool":"email.send","payload":"{\"user_id\":\"me\"}"}}"#,
        )
        .unwrap();
        let action = reply.action.unwrap();
        assert_eq!(action.tool, "email.send");
        assert_eq!(action.payload.get("user_id"), Some(&json!("me")));

        let err = decode_text(r#"{"response":"","action":{"tool":"tasks.list","payload":"[1]"}}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidShape(_)));
    }

    #[test]
    fn absent_or_blank_arguments_are_an_empty_payload() {
        for function in [
            json!({"name": "spotify_pause"}),
            json!({"name": "spotify_pause", "arguments": null}),
            json!({"name": "spotify_pause", "arguments": ""}),
            json!({"name": "spotify_pause", "arguments": "  "}),
        ] {
            let message = json!({"tool_calls": [{"function": function}]});
            let action = decode_choice(&message).unwrap().action.unwrap();
            assert_eq!(action.tool, "spotify_pause");
            assert!(action.payload.is_empty(), "function: {function}");
        }

        let legacy = json!({"function_call": {"name": "tasks_list"}});
        let action = decode_choice(&legacy).unwrap().action.unwrap();
        assert!(action.payload.is_empty());
    }

    #[test]
    fn message_falls_back_to_tool_call_when_content_is_prose() {
        let message = json!({
            "content": "Claro, vou tocar.",
            "tool_calls": [{"function": {"name": "spotify_play", "arguments": "{}"}}]
        });
        assert!(decode_choice(&message).is_err());
        let reply = decode_message(&message).unwrap();
        assert_eq!(reply.action.unwrap().tool, "spotify_play");
    }
}
