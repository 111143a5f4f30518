//! The closed message type enumeration.

use serde::{Deserialize, Serialize};

/// Every message type the tunnel speaks.
///
/// The set is closed and versioned with the crate: an unknown `type` string
/// on the wire is a protocol error, not something to route around.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Ping,
    Pong,
    ContextPing,
    ContextPong,
    DeviceRegistration,
    ChatRequestStream,
    ChatRequestNoStream,
    ChatResponseStream,
    ChatResponse,
    CompletionRequestStream,
    CompletionRequestNoStream,
    CompletionResponseStream,
    CompletionResponse,
}

/// Traffic class a message type belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageFamily {
    Keepalive,
    Registration,
    Chat,
    Completion,
}

impl MessageType {
    /// Parse a wire identifier. Returns `None` for anything outside the
    /// enumeration.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "context-ping" => Some(Self::ContextPing),
            "context-pong" => Some(Self::ContextPong),
            "device-registration" => Some(Self::DeviceRegistration),
            "chat-request-stream" => Some(Self::ChatRequestStream),
            "chat-request-no-stream" => Some(Self::ChatRequestNoStream),
            "chat-response-stream" => Some(Self::ChatResponseStream),
            "chat-response" => Some(Self::ChatResponse),
            "completion-request-stream" => Some(Self::CompletionRequestStream),
            "completion-request-no-stream" => Some(Self::CompletionRequestNoStream),
            "completion-response-stream" => Some(Self::CompletionResponseStream),
            "completion-response" => Some(Self::CompletionResponse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ContextPing => "context-ping",
            Self::ContextPong => "context-pong",
            Self::DeviceRegistration => "device-registration",
            Self::ChatRequestStream => "chat-request-stream",
            Self::ChatRequestNoStream => "chat-request-no-stream",
            Self::ChatResponseStream => "chat-response-stream",
            Self::ChatResponse => "chat-response",
            Self::CompletionRequestStream => "completion-request-stream",
            Self::CompletionRequestNoStream => "completion-request-no-stream",
            Self::CompletionResponseStream => "completion-response-stream",
            Self::CompletionResponse => "completion-response",
        }
    }

    pub fn family(&self) -> MessageFamily {
        match self {
            Self::Ping | Self::Pong | Self::ContextPing | Self::ContextPong => {
                MessageFamily::Keepalive
            }
            Self::DeviceRegistration => MessageFamily::Registration,
            Self::ChatRequestStream
            | Self::ChatRequestNoStream
            | Self::ChatResponseStream
            | Self::ChatResponse => MessageFamily::Chat,
            Self::CompletionRequestStream
            | Self::CompletionRequestNoStream
            | Self::CompletionResponseStream
            | Self::CompletionResponse => MessageFamily::Completion,
        }
    }

    /// Whether this type carries an inference request payload.
    pub fn is_inference_request(&self) -> bool {
        matches!(
            self,
            Self::ChatRequestStream
                | Self::ChatRequestNoStream
                | Self::CompletionRequestStream
                | Self::CompletionRequestNoStream
        )
    }

    /// Whether this type is the streaming variant of its family.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::ChatRequestStream
                | Self::ChatResponseStream
                | Self::CompletionRequestStream
                | Self::CompletionResponseStream
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
