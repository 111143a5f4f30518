//! The canonical wire envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::ids::EndpointId;
use crate::message::MessageType;
use crate::payload;

/// Canonical wire shape: `{ "type", "from", "to", "payload" }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: EndpointId,
    pub to: EndpointId,
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope from a typed payload.
    pub fn encode<T: Serialize>(
        message_type: MessageType,
        from: EndpointId,
        to: EndpointId,
        payload: &T,
    ) -> Result<Self, ValidationError> {
        let payload = serde_json::to_value(payload).map_err(|e| {
            ValidationError::PayloadMismatch {
                message_type,
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            message_type,
            from,
            to,
            payload,
        })
    }

    /// Validate a raw wire document into an envelope.
    ///
    /// Checks presence of `type`, `from`, `to`, and `payload`, membership of
    /// `type` in the closed enumeration, and that the payload matches the
    /// schema registered for the type. Pure: no side effects on failure.
    pub fn from_value(raw: Value) -> Result<Self, ValidationError> {
        let obj = match raw {
            Value::Object(obj) => obj,
            _ => return Err(ValidationError::NotAnObject),
        };

        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("type"))?;
        let message_type = MessageType::parse(type_str)
            .ok_or_else(|| ValidationError::UnknownType(type_str.to_string()))?;

        let from = obj
            .get("from")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("from"))?;
        let to = obj
            .get("to")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("to"))?;
        let payload = obj
            .get("payload")
            .cloned()
            .ok_or(ValidationError::MissingField("payload"))?;

        let envelope = Self {
            message_type,
            from: EndpointId::new(from),
            to: EndpointId::new(to),
            payload,
        };
        envelope.validate_payload()?;
        Ok(envelope)
    }

    /// The closed type→schema registry: every member of the enumeration has
    /// exactly one payload schema, checked here.
    pub fn validate_payload(&self) -> Result<(), ValidationError> {
        match self.message_type {
            MessageType::Ping | MessageType::Pong => {
                self.decode_payload::<payload::PingPayload>().map(|_| ())
            }
            MessageType::ContextPing => self
                .decode_payload::<payload::ContextPingPayload>()
                .map(|_| ()),
            MessageType::ContextPong => self
                .decode_payload::<payload::ContextPongPayload>()
                .map(|_| ()),
            MessageType::DeviceRegistration => self
                .decode_payload::<payload::RegistrationBody>()
                .map(|_| ()),
            MessageType::ChatRequestStream
            | MessageType::ChatRequestNoStream
            | MessageType::CompletionRequestStream
            | MessageType::CompletionRequestNoStream => {
                let request = self.decode_payload::<payload::InferenceRequest>()?;
                payload::check_request_shape(&request, self.message_type).map_err(|reason| {
                    ValidationError::PayloadMismatch {
                        message_type: self.message_type,
                        reason,
                    }
                })
            }
            MessageType::ChatResponseStream | MessageType::CompletionResponseStream => {
                self.decode_payload::<payload::ResponseChunk>().map(|_| ())
            }
            MessageType::ChatResponse | MessageType::CompletionResponse => self
                .decode_payload::<payload::InferenceResponse>()
                .map(|_| ()),
        }
    }

    /// Decode the payload into its typed schema.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ValidationError::PayloadMismatch {
                message_type: self.message_type,
                reason: e.to_string(),
            }
        })
    }
}
