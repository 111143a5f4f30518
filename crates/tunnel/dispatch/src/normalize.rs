//! Wire-shape normalizer.
//!
//! Some producers emit a nested request shape with the body one level deeper:
//! `{ taskId, data: { model, messages, ... } }`. This pass rewrites it into
//! the canonical flat payload before type-specific validation, so handlers
//! never branch on producer vintage. Messages already in canonical form pass
//! through untouched.

use serde_json::{Map, Value};
use tunnel_types::{MessageType, DEFAULT_CHAT_PATH, DEFAULT_COMPLETION_PATH};

use crate::error::NormalizeError;

/// Generation parameters carried through unchanged from the nested body.
const PASSTHROUGH_PARAMS: &[&str] = &[
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "prompt",
    "stream",
];

/// Rewrite a raw wire document into canonical shape.
///
/// A message is nested iff `payload.data` is present; it then must carry
/// `payload.taskId` as well. Anything without `payload.data` is assumed
/// canonical and returned unchanged.
pub fn normalize(raw: Value) -> Result<Value, NormalizeError> {
    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => return Ok(raw),
    };
    let payload = match obj.get("payload").and_then(Value::as_object) {
        Some(payload) => payload,
        None => return Ok(raw),
    };
    let data = match payload.get("data") {
        Some(data) => data,
        None => return Ok(raw),
    };

    let task_id = payload
        .get("taskId")
        .cloned()
        .ok_or(NormalizeError::MissingTaskIdOrData)?;
    let data = data
        .as_object()
        .ok_or(NormalizeError::DataNotAnObject)?
        .clone();

    let mut flat = Map::new();
    flat.insert("taskId".to_string(), task_id);
    flat.insert(
        "path".to_string(),
        payload
            .get("path")
            .cloned()
            .unwrap_or_else(|| Value::String(default_path(obj).to_string())),
    );
    if let Some(model) = data.get("model") {
        flat.insert("model".to_string(), model.clone());
    }
    flat.insert(
        "messages".to_string(),
        data.get("messages").cloned().unwrap_or(Value::Array(vec![])),
    );
    for key in PASSTHROUGH_PARAMS {
        if let Some(value) = data.get(*key) {
            flat.insert((*key).to_string(), value.clone());
        }
    }
    // stream may also sit at the payload level in the nested shape
    if !flat.contains_key("stream") {
        if let Some(stream) = payload.get("stream") {
            flat.insert("stream".to_string(), stream.clone());
        }
    }

    let mut normalized = obj.clone();
    normalized.insert("payload".to_string(), Value::Object(flat));
    Ok(Value::Object(normalized))
}

fn default_path(envelope: &Map<String, Value>) -> &'static str {
    let family = envelope
        .get("type")
        .and_then(Value::as_str)
        .and_then(MessageType::parse)
        .map(|mt| mt.family());
    match family {
        Some(tunnel_types::MessageFamily::Completion) => DEFAULT_COMPLETION_PATH,
        _ => DEFAULT_CHAT_PATH,
    }
}
