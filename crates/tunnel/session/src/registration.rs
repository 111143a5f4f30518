//! Device registration flow.
//!
//! Registration is a precondition for inference traffic, not best-effort:
//! until a device's descriptor validates, the relay rejects its tasks
//! outright. A re-registration request walks the session back through
//! `Pending` and re-validates from scratch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use tunnel_dispatch::{DispatchContext, DispatchError, MessageHandler};
use tunnel_transport::TunnelTransport;
use tunnel_types::{
    EndpointId, Envelope, MessageType, RegistrationAck, RegistrationBody, RegistrationPayload,
};

use crate::error::SessionError;
use crate::session::{RegistrationState, SessionTable};

/// Income `device-registration`: validate the announced identity and answer
/// with an acknowledgment either way.
pub struct RegistrationIncomeHandler {
    sessions: Arc<SessionTable>,
    local: EndpointId,
}

impl RegistrationIncomeHandler {
    pub fn new(sessions: Arc<SessionTable>, local: EndpointId) -> Self {
        Self { sessions, local }
    }

    fn validate(descriptor: &RegistrationPayload) -> Result<(), String> {
        if descriptor.device_id.is_empty() {
            return Err("empty device id".to_string());
        }
        if descriptor.capabilities.is_empty() {
            return Err("no capabilities announced".to_string());
        }
        if descriptor.version.trim().is_empty() {
            return Err("missing version".to_string());
        }
        Ok(())
    }

    async fn handle_announce(
        &self,
        descriptor: RegistrationPayload,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let device_id = descriptor.device_id.clone();
        self.sessions.touch(&device_id);
        self.sessions
            .set_registration(&device_id, RegistrationState::Pending);

        match Self::validate(&descriptor) {
            Ok(()) => {
                self.sessions
                    .set_registration(&device_id, RegistrationState::Registered);
                info!(
                    device_id = %device_id,
                    capabilities = descriptor.capabilities.len(),
                    version = %descriptor.version,
                    "device registered"
                );

                let ack = Envelope::encode(
                    MessageType::DeviceRegistration,
                    self.local.clone(),
                    device_id.clone().into(),
                    &RegistrationAck {
                        device_id,
                        accepted: true,
                        reason: None,
                    },
                )?;
                ctx.emitter.emit(ack).await
            }
            Err(reason) => {
                self.sessions
                    .set_registration(&device_id, RegistrationState::Unregistered);
                warn!(device_id = %device_id, reason = %reason, "registration rejected");

                let nack = Envelope::encode(
                    MessageType::DeviceRegistration,
                    self.local.clone(),
                    device_id.clone().into(),
                    &RegistrationAck {
                        device_id: device_id.clone(),
                        accepted: false,
                        reason: Some(reason.clone()),
                    },
                )?;
                ctx.emitter.emit(nack).await?;

                Err(DispatchError::handler(
                    MessageType::DeviceRegistration,
                    SessionError::RegistrationRejected { device_id, reason },
                ))
            }
        }
    }

    /// A device-side process receives the gateway's ack through the same
    /// income key.
    fn handle_ack(&self, ack: RegistrationAck) -> Result<(), DispatchError> {
        let state = if ack.accepted {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        };
        self.sessions.set_registration(&ack.device_id, state);
        info!(
            device_id = %ack.device_id,
            accepted = ack.accepted,
            reason = ack.reason.as_deref().unwrap_or(""),
            "registration acknowledged"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RegistrationIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        match envelope.decode_payload::<RegistrationBody>()? {
            RegistrationBody::Announce(descriptor) => self.handle_announce(descriptor, ctx).await,
            RegistrationBody::Ack(ack) => self.handle_ack(ack),
        }
    }
}

/// Outcome `device-registration`: serialize the descriptor or ack and hand
/// it to the transport. No registration logic lives here.
pub struct RegistrationOutcomeHandler {
    transport: Arc<dyn TunnelTransport>,
}

impl RegistrationOutcomeHandler {
    pub fn new(transport: Arc<dyn TunnelTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl MessageHandler for RegistrationOutcomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        _ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        envelope.validate_payload()?;
        self.transport
            .send(&envelope)
            .await
            .map_err(|e| DispatchError::handler(MessageType::DeviceRegistration, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use tunnel_dispatch::{Direction, HandlerRegistry};
    use tunnel_transport::InMemoryTransport;
    use tunnel_types::DeviceId;

    fn setup() -> (
        Arc<SessionTable>,
        Arc<InMemoryTransport>,
        Arc<HandlerRegistry>,
    ) {
        let sessions = Arc::new(SessionTable::new());
        let transport = Arc::new(InMemoryTransport::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                Direction::Income,
                MessageType::DeviceRegistration,
                Arc::new(RegistrationIncomeHandler::new(
                    sessions.clone(),
                    EndpointId::new("gateway"),
                )),
            )
            .unwrap();
        let transport_obj: Arc<dyn TunnelTransport> = transport.clone();
        registry
            .register(
                Direction::Outcome,
                MessageType::DeviceRegistration,
                Arc::new(RegistrationOutcomeHandler::new(transport_obj)),
            )
            .unwrap();
        (sessions, transport, Arc::new(registry))
    }

    fn announce(device: &str, capabilities: Vec<&str>) -> Envelope {
        Envelope::encode(
            MessageType::DeviceRegistration,
            EndpointId::new(device),
            EndpointId::new("gateway"),
            &RegistrationPayload {
                device_id: DeviceId::new(device),
                capabilities: capabilities.into_iter().map(String::from).collect(),
                version: "1.2.0".into(),
            },
        )
        .unwrap()
    }

    fn ctx_for(registry: &Arc<HandlerRegistry>, device: &str) -> DispatchContext {
        DispatchContext::new(
            registry.clone(),
            DeviceId::new(device),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn valid_announce_registers_and_acks() {
        let (sessions, transport, registry) = setup();
        let ctx = ctx_for(&registry, "dev-1");

        registry
            .dispatch(Direction::Income, announce("dev-1", vec!["chat"]), &ctx)
            .await
            .unwrap();

        assert!(sessions.is_registered(&DeviceId::new("dev-1")));
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        match sent[0].decode_payload::<RegistrationBody>().unwrap() {
            RegistrationBody::Ack(ack) => {
                assert!(ack.accepted);
                assert!(ack.reason.is_none());
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_announce_nacks_and_stays_unregistered() {
        let (sessions, transport, registry) = setup();
        let ctx = ctx_for(&registry, "dev-1");

        let err = registry
            .dispatch(Direction::Income, announce("dev-1", vec![]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler { .. }));

        assert!(!sessions.is_registered(&DeviceId::new("dev-1")));
        let session = sessions.get(&DeviceId::new("dev-1")).unwrap();
        assert_eq!(session.registration, RegistrationState::Unregistered);

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        match sent[0].decode_payload::<RegistrationBody>().unwrap() {
            RegistrationBody::Ack(ack) => {
                assert!(!ack.accepted);
                assert_eq!(ack.reason.as_deref(), Some("no capabilities announced"));
            }
            other => panic!("expected nack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn re_registration_revalidates() {
        let (sessions, _transport, registry) = setup();
        let ctx = ctx_for(&registry, "dev-1");

        registry
            .dispatch(Direction::Income, announce("dev-1", vec!["chat"]), &ctx)
            .await
            .unwrap();
        assert!(sessions.is_registered(&DeviceId::new("dev-1")));

        // Second announce with a broken descriptor drops the registration.
        let _ = registry
            .dispatch(Direction::Income, announce("dev-1", vec![]), &ctx)
            .await;
        assert!(!sessions.is_registered(&DeviceId::new("dev-1")));
    }
}
