//! Envelope validation errors.

use thiserror::Error;

use crate::message::MessageType;

/// Rejections produced while turning a raw wire document into an [`crate::Envelope`].
///
/// Validation is pure: a failed message is dropped before dispatch and never
/// observed by handlers.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("payload does not match schema for {message_type}: {reason}")]
    PayloadMismatch {
        message_type: MessageType,
        reason: String,
    },
}
