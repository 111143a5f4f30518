//! Per-dispatch context handed to handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tunnel_types::{DeviceId, Envelope};

use crate::error::DispatchError;
use crate::registry::{Direction, HandlerRegistry};

/// Emit function bound to the Outcome side of the registry.
///
/// Handlers construct outbound intents as envelopes and emit them here; the
/// matching Outcome handler owns serialization and the transport hand-off.
#[derive(Clone)]
pub struct Emitter {
    registry: Arc<HandlerRegistry>,
    device_id: DeviceId,
    cancel: CancellationToken,
}

impl Emitter {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        device_id: DeviceId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            device_id,
            cancel,
        }
    }

    pub async fn emit(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let ctx = DispatchContext {
            device_id: self.device_id.clone(),
            emitter: self.clone(),
            cancel: self.cancel.clone(),
        };
        self.registry
            .dispatch(Direction::Outcome, envelope, &ctx)
            .await
    }
}

/// What a handler sees besides the envelope: the originating device,
/// an [`Emitter`] for outbound intents, and the cancellation signal tied to
/// connection teardown.
#[derive(Clone)]
pub struct DispatchContext {
    pub device_id: DeviceId,
    pub emitter: Emitter,
    pub cancel: CancellationToken,
}

impl DispatchContext {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        device_id: DeviceId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device_id: device_id.clone(),
            emitter: Emitter::new(registry, device_id, cancel.clone()),
            cancel,
        }
    }
}
