//! Type-specific payload schemas.
//!
//! One schema per message type; [`crate::Envelope::validate_payload`] is the
//! closed registry that pairs them. Field names follow the wire: correlation
//! ids are camelCase (`taskId`, `deviceId`), generation parameters are
//! snake_case as emitted by inference clients.

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, TaskId};
use crate::message::{MessageFamily, MessageType};

/// Default inference route when a producer omits `path` (chat family).
pub const DEFAULT_CHAT_PATH: &str = "/v1/chat/completions";

/// Default inference route when a producer omits `path` (completion family).
pub const DEFAULT_COMPLETION_PATH: &str = "/v1/completions";

/// Payload of `ping` and `pong`.
///
/// `token` is echoed verbatim by the pong so the initiator can match the
/// round trip; `timestamp` is the sender's unix-millisecond clock, used for
/// RTT measurement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingPayload {
    pub token: String,
    pub timestamp: i64,
}

/// Payload of `context-ping`: asks whether a specific task context is still live.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextPingPayload {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub token: String,
}

/// Payload of `context-pong`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextPongPayload {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub token: String,
    pub live: bool,
}

/// Identity and capability descriptor a device announces on registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationPayload {
    #[serde(rename = "deviceId")]
    pub device_id: DeviceId,
    pub capabilities: Vec<String>,
    pub version: String,
}

/// Gateway acknowledgment of a registration attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationAck {
    #[serde(rename = "deviceId")]
    pub device_id: DeviceId,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The `device-registration` type carries the descriptor in one direction
/// and the acknowledgment in the other.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistrationBody {
    Announce(RegistrationPayload),
    Ack(RegistrationAck),
}

/// One turn of a chat conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Canonical (flat) inference request payload, chat or completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

impl InferenceRequest {
    /// The route this request targets, falling back to the family default.
    pub fn path_or_default(&self, family: MessageFamily) -> &str {
        match &self.path {
            Some(p) => p.as_str(),
            None if family == MessageFamily::Completion => DEFAULT_COMPLETION_PATH,
            None => DEFAULT_CHAT_PATH,
        }
    }
}

/// One streamed output chunk. `done = true` is the end-of-stream sentinel;
/// an error-carrying chunk is always terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseChunk {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub index: u64,
    pub content: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Complete (non-streaming) inference response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Token accounting reported with a complete response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Family-specific request checks that serde alone cannot express.
pub(crate) fn check_request_shape(
    request: &InferenceRequest,
    message_type: MessageType,
) -> Result<(), String> {
    match message_type.family() {
        MessageFamily::Completion if request.prompt.is_none() => {
            Err("completion request requires a prompt".to_string())
        }
        _ => Ok(()),
    }
}
