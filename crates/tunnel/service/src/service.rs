//! Service assembly and the inbound dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tunnel_dispatch::{
    normalize, Direction, DispatchContext, DispatchError, HandlerRegistry, MessageHandler,
};
use tunnel_engine::InferenceEngine;
use tunnel_governor::GovernorPool;
use tunnel_relay::{
    InferenceRelay, RelayOutcomeHandler, RequestIncomeHandler, ResponseIncomeHandler, TaskTable,
};
use tunnel_session::{
    ContextPingIncomeHandler, ContextPongIncomeHandler, KeepaliveDriver, KeepaliveOutcomeHandler,
    PingIncomeHandler, PongIncomeHandler, RegistrationIncomeHandler, RegistrationOutcomeHandler,
    SessionEvent, SessionTable,
};
use tunnel_transport::TunnelTransport;
use tunnel_types::{DeviceId, EndpointId, Envelope, MessageType};

use crate::config::TunnelConfig;

const RELAY_TYPES: [MessageType; 8] = [
    MessageType::ChatRequestStream,
    MessageType::ChatRequestNoStream,
    MessageType::ChatResponseStream,
    MessageType::ChatResponse,
    MessageType::CompletionRequestStream,
    MessageType::CompletionRequestNoStream,
    MessageType::CompletionResponseStream,
    MessageType::CompletionResponse,
];

/// A running tunnel endpoint: session table, task table, handler registry,
/// and the keepalive driver, assembled from one config.
///
/// Handler registration happens once in [`TunnelService::new`]; any duplicate
/// key is a startup configuration error and fails construction.
pub struct TunnelService {
    config: TunnelConfig,
    sessions: Arc<SessionTable>,
    relay: Arc<InferenceRelay>,
    registry: Arc<HandlerRegistry>,
    governors: Arc<GovernorPool>,
    driver: Arc<KeepaliveDriver>,
    cancel: CancellationToken,
}

impl TunnelService {
    pub fn new(
        config: TunnelConfig,
        transport: Arc<dyn TunnelTransport>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, DispatchError> {
        let local = EndpointId::new(config.local_endpoint.clone());
        let sessions = Arc::new(SessionTable::new());
        let tasks = Arc::new(TaskTable::new());
        let governors = Arc::new(GovernorPool::new());
        let cancel = CancellationToken::new();

        let relay = Arc::new(InferenceRelay::new(
            sessions.clone(),
            tasks.clone(),
            engine,
            governors.clone(),
            config.relay,
            local.clone(),
        ));

        let mut registry = HandlerRegistry::new();

        // keepalive
        registry.register(
            Direction::Income,
            MessageType::Ping,
            Arc::new(PingIncomeHandler::new(sessions.clone(), local.clone())),
        )?;
        registry.register(
            Direction::Income,
            MessageType::Pong,
            Arc::new(PongIncomeHandler::new(sessions.clone())),
        )?;
        registry.register(
            Direction::Income,
            MessageType::ContextPing,
            Arc::new(ContextPingIncomeHandler::new(
                sessions.clone(),
                tasks.clone(),
                local.clone(),
            )),
        )?;
        registry.register(
            Direction::Income,
            MessageType::ContextPong,
            Arc::new(ContextPongIncomeHandler::new(sessions.clone())),
        )?;
        let keepalive_outcome: Arc<dyn MessageHandler> =
            Arc::new(KeepaliveOutcomeHandler::new(transport.clone()));
        for message_type in [
            MessageType::Ping,
            MessageType::Pong,
            MessageType::ContextPing,
            MessageType::ContextPong,
        ] {
            registry.register(Direction::Outcome, message_type, keepalive_outcome.clone())?;
        }

        // registration
        registry.register(
            Direction::Income,
            MessageType::DeviceRegistration,
            Arc::new(RegistrationIncomeHandler::new(
                sessions.clone(),
                local.clone(),
            )),
        )?;
        registry.register(
            Direction::Outcome,
            MessageType::DeviceRegistration,
            Arc::new(RegistrationOutcomeHandler::new(transport.clone())),
        )?;

        // inference relay
        let request_income: Arc<dyn MessageHandler> =
            Arc::new(RequestIncomeHandler::new(relay.clone()));
        for message_type in [
            MessageType::ChatRequestStream,
            MessageType::ChatRequestNoStream,
            MessageType::CompletionRequestStream,
            MessageType::CompletionRequestNoStream,
        ] {
            registry.register(Direction::Income, message_type, request_income.clone())?;
        }
        let response_income: Arc<dyn MessageHandler> =
            Arc::new(ResponseIncomeHandler::new(relay.clone()));
        for message_type in [
            MessageType::ChatResponseStream,
            MessageType::ChatResponse,
            MessageType::CompletionResponseStream,
            MessageType::CompletionResponse,
        ] {
            registry.register(Direction::Income, message_type, response_income.clone())?;
        }
        let relay_outcome: Arc<dyn MessageHandler> =
            Arc::new(RelayOutcomeHandler::new(transport.clone()));
        for message_type in RELAY_TYPES {
            registry.register(Direction::Outcome, message_type, relay_outcome.clone())?;
        }

        let registry = Arc::new(registry);
        let driver = Arc::new(KeepaliveDriver::new(
            sessions.clone(),
            registry.clone(),
            governors.clone(),
            local,
            config.keepalive,
            cancel.clone(),
        ));

        info!(
            handlers = registry.len(),
            endpoint = %config.local_endpoint,
            "tunnel service assembled"
        );

        Ok(Self {
            config,
            sessions,
            relay,
            registry,
            governors,
            driver,
            cancel,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn relay(&self) -> &Arc<InferenceRelay> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Online/offline transitions from the keepalive driver.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.driver.subscribe()
    }

    /// Context for a controller-side submission toward `device_id`.
    pub fn context_for(&self, device_id: DeviceId) -> DispatchContext {
        DispatchContext::new(self.registry.clone(), device_id, self.cancel.child_token())
    }

    /// Start the periodic drivers: keepalive and terminal-task purging.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let keepalive = self.driver.clone().spawn();

        let relay = self.relay.clone();
        let cancel = self.cancel.clone();
        let purge_every = relay.retention().max(Duration::from_secs(1)) / 2;
        let purge = tokio::spawn(async move {
            let mut interval = tokio::time::interval(purge_every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let purged = relay.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "purged expired task records");
                        }
                    }
                }
            }
        });

        vec![keepalive, purge]
    }

    /// Consume raw inbound documents until the channel closes or the service
    /// is cancelled. Per-message failures are logged and isolated; nothing a
    /// peer sends can stop the loop.
    pub fn spawn_inbound(self: &Arc<Self>, mut rx: mpsc::Receiver<Value>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = service.cancel.cancelled() => return,
                    raw = rx.recv() => match raw {
                        Some(raw) => raw,
                        None => return,
                    },
                };
                service.handle_inbound(raw).await;
            }
        })
    }

    /// Normalize, validate, and dispatch one raw document.
    pub async fn handle_inbound(&self, raw: Value) {
        let normalized = match normalize(raw) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!(error = %e, "rejected nonconforming message");
                return;
            }
        };
        let envelope = match Envelope::from_value(normalized) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "rejected invalid envelope");
                return;
            }
        };

        let device_id = DeviceId::new(envelope.from.as_str());
        let ctx = DispatchContext::new(
            self.registry.clone(),
            device_id,
            self.cancel.child_token(),
        );
        if let Err(e) = self
            .registry
            .dispatch(Direction::Income, envelope, &ctx)
            .await
        {
            // isolated to this message; the connection stays alive
            warn!(error = %e, "income dispatch failed");
        }
    }

    /// Tear down loops and cancel whatever is still running.
    pub fn shutdown(&self) {
        info!("tunnel service shutting down");
        self.cancel.cancel();
        self.governors.close_all();
    }
}
