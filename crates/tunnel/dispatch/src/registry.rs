//! Direction-aware handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};
use tunnel_types::{Envelope, MessageType};

use crate::context::DispatchContext;
use crate::error::DispatchError;

/// Direction of a message relative to the local process. The same logical
/// event has a distinct handler per direction: receiving a pong and sending
/// one are different side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Income,
    Outcome,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Income => write!(f, "income"),
            Direction::Outcome => write!(f, "outcome"),
        }
    }
}

/// One registered capability: handles every message of its (direction, type).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, ctx: &DispatchContext)
        -> Result<(), DispatchError>;
}

/// Dispatch table keyed by (direction, type).
///
/// Built once at process start on `&mut self`, then shared immutably; a
/// duplicate key is a configuration error, not a runtime condition. Lookup
/// never falls back to a default handler: an unrecognized type must be
/// observable, not swallowed.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(Direction, MessageType), Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        direction: Direction,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        let key = (direction, message_type);
        if self.handlers.contains_key(&key) {
            return Err(DispatchError::DuplicateHandler {
                direction,
                message_type,
            });
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn contains(&self, direction: Direction, message_type: MessageType) -> bool {
        self.handlers.contains_key(&(direction, message_type))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route one envelope. Pure routing: no per-type logic lives here.
    #[instrument(skip(self, envelope, ctx), fields(message_type = %envelope.message_type, direction = %direction))]
    pub async fn dispatch(
        &self,
        direction: Direction,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(&(direction, envelope.message_type))
            .ok_or(DispatchError::UnknownMessageType {
                message_type: envelope.message_type,
                direction,
            })?;

        trace!("dispatching");
        handler.handle(envelope, ctx).await
    }
}
