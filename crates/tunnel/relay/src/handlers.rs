//! Thin handler shims binding the registry to the relay.
//!
//! Routing stays in the registry, behavior stays in [`InferenceRelay`];
//! these types only adapt one to the other. The outcome handler performs
//! serialization hand-off to the transport and nothing else.

use std::sync::Arc;

use async_trait::async_trait;

use tunnel_dispatch::{DispatchContext, DispatchError, MessageHandler};
use tunnel_transport::TunnelTransport;
use tunnel_types::Envelope;

use crate::relay::InferenceRelay;

/// Income side of the four `*-request-*` types.
pub struct RequestIncomeHandler {
    relay: Arc<InferenceRelay>,
}

impl RequestIncomeHandler {
    pub fn new(relay: Arc<InferenceRelay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl MessageHandler for RequestIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.relay.accept(envelope, ctx).await
    }
}

/// Income side of the four `*-response*` types (gateway role).
pub struct ResponseIncomeHandler {
    relay: Arc<InferenceRelay>,
}

impl ResponseIncomeHandler {
    pub fn new(relay: Arc<InferenceRelay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl MessageHandler for ResponseIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.relay.handle_response(envelope, ctx).await
    }
}

/// Outcome side of every relay type: envelope to transport, no business
/// logic.
pub struct RelayOutcomeHandler {
    transport: Arc<dyn TunnelTransport>,
}

impl RelayOutcomeHandler {
    pub fn new(transport: Arc<dyn TunnelTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl MessageHandler for RelayOutcomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        _ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let message_type = envelope.message_type;
        self.transport
            .send(&envelope)
            .await
            .map_err(|e| DispatchError::handler(message_type, e))
    }
}
