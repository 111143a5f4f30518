//! Dispatch and normalization errors.

use thiserror::Error;
use tunnel_types::{MessageType, ValidationError};

use crate::registry::Direction;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Startup misconfiguration; fatal at init, never silently overridden.
    #[error("duplicate handler registered for {direction} {message_type}")]
    DuplicateHandler {
        direction: Direction,
        message_type: MessageType,
    },

    /// No handler for this (direction, type). Carries both fields so callers
    /// can log actionable diagnostics; there is no default handler.
    #[error("no handler registered for {message_type} ({direction})")]
    UnknownMessageType {
        message_type: MessageType,
        direction: Direction,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A handler rejected or failed the message. Isolated to that message.
    #[error("{message_type} handler failed: {source}")]
    Handler {
        message_type: MessageType,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DispatchError {
    pub fn handler(
        message_type: MessageType,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Handler {
            message_type,
            source: Box::new(source),
        }
    }
}

/// Rejections of the legacy nested wire shape.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("nested payload missing taskId or data")]
    MissingTaskIdOrData,

    #[error("nested payload data is not an object")]
    DataNotAnObject,
}
