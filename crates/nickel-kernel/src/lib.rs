mod classifier;
mod decoder;
mod history;
mod prompt;
mod reconcile;

pub use classifier::{
    classify, is_high_confidence, AMBIGUOUS_CONFIDENCE, HIGH_CONFIDENCE_THRESHOLD,
};
pub use decoder::{decode, decode_choice, decode_message, decode_text, decode_tool_call, DecodeError};
pub use history::{history_window, sanitize_history};
pub use prompt::{
    build_messages, function_tools, json_object_format, reply_json_schema, tool_choice,
    tool_documentation, PromptMessage, PromptStyle, DEFAULT_SYSTEM_PROMPT,
};
pub use reconcile::{reconcile, Reconciliation};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// Fingerprint of a JSON value that does not depend on key order or formatting.
pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
