//! Keepalive subsystem: ping/pong, context-ping/pong, and the periodic
//! driver that moves sessions between online and offline.
//!
//! Two liveness layers share the wire: `ping`/`pong` answer "is the
//! connection alive", `context-ping`/`context-pong` answer "is this task
//! context still live". Only pong absence flips a session offline; a failed
//! outbound ping is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tunnel_dispatch::{DispatchContext, DispatchError, Emitter, HandlerRegistry, MessageHandler};
use tunnel_governor::{GovernorConfig, GovernorPool};
use tunnel_transport::TunnelTransport;
use tunnel_types::{
    ContextPingPayload, ContextPongPayload, EndpointId, Envelope, MessageType, PingPayload, TaskId,
};

use crate::session::{DeviceStatus, SessionEvent, SessionTable};

/// Name of the governor bounding concurrent outbound keepalive sends.
pub const KEEPALIVE_GOVERNOR: &str = "keepalive";

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Ping cadence.
    pub interval_ms: u64,
    /// A session with no pong for `timeout_multiplier × interval` goes offline.
    pub timeout_multiplier: u32,
    /// Ceiling on concurrent outbound pings.
    pub max_concurrent_pings: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_multiplier: 3,
            max_concurrent_pings: 8,
        }
    }
}

impl KeepaliveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.interval_ms * self.timeout_multiplier as u64)
    }
}

/// Answers whether a task context is still live, without coupling the
/// session crate to the relay's task table.
pub trait ContextProbe: Send + Sync {
    fn is_live(&self, task_id: &TaskId) -> bool;
}

/// Income `ping`: record liveness, answer with a pong echoing the token and
/// the sender's timestamp.
pub struct PingIncomeHandler {
    sessions: Arc<SessionTable>,
    local: EndpointId,
}

impl PingIncomeHandler {
    pub fn new(sessions: Arc<SessionTable>, local: EndpointId) -> Self {
        Self { sessions, local }
    }
}

#[async_trait]
impl MessageHandler for PingIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let ping: PingPayload = envelope.decode_payload()?;
        self.sessions.touch(&ctx.device_id);

        let pong = Envelope::encode(
            MessageType::Pong,
            self.local.clone(),
            envelope.from,
            &PingPayload {
                token: ping.token,
                timestamp: ping.timestamp,
            },
        )?;
        ctx.emitter.emit(pong).await
    }
}

/// Income `pong`: record liveness and the measured round trip.
pub struct PongIncomeHandler {
    sessions: Arc<SessionTable>,
}

impl PongIncomeHandler {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl MessageHandler for PongIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let pong: PingPayload = envelope.decode_payload()?;
        self.sessions.touch(&ctx.device_id);

        let rtt_ms = Utc::now().timestamp_millis() - pong.timestamp;
        trace!(device_id = %ctx.device_id, rtt_ms, "pong received");
        Ok(())
    }
}

/// Income `context-ping`: report whether the named task context is live.
pub struct ContextPingIncomeHandler {
    sessions: Arc<SessionTable>,
    probe: Arc<dyn ContextProbe>,
    local: EndpointId,
}

impl ContextPingIncomeHandler {
    pub fn new(sessions: Arc<SessionTable>, probe: Arc<dyn ContextProbe>, local: EndpointId) -> Self {
        Self {
            sessions,
            probe,
            local,
        }
    }
}

#[async_trait]
impl MessageHandler for ContextPingIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let ping: ContextPingPayload = envelope.decode_payload()?;
        self.sessions.touch(&ctx.device_id);

        let live = self.probe.is_live(&ping.task_id);
        let pong = Envelope::encode(
            MessageType::ContextPong,
            self.local.clone(),
            envelope.from,
            &ContextPongPayload {
                task_id: ping.task_id,
                token: ping.token,
                live,
            },
        )?;
        ctx.emitter.emit(pong).await
    }
}

/// Income `context-pong`: liveness bookkeeping for the asking side.
pub struct ContextPongIncomeHandler {
    sessions: Arc<SessionTable>,
}

impl ContextPongIncomeHandler {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl MessageHandler for ContextPongIncomeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let pong: ContextPongPayload = envelope.decode_payload()?;
        self.sessions.touch(&ctx.device_id);
        debug!(device_id = %ctx.device_id, task_id = %pong.task_id, live = pong.live, "context-pong received");
        Ok(())
    }
}

/// Outcome side for the whole keepalive family: hand the envelope to the
/// transport. One instance is registered under each outcome keepalive type.
pub struct KeepaliveOutcomeHandler {
    transport: Arc<dyn TunnelTransport>,
}

impl KeepaliveOutcomeHandler {
    pub fn new(transport: Arc<dyn TunnelTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl MessageHandler for KeepaliveOutcomeHandler {
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

/// Periodic driver emitting pings and applying the timeout policy.
///
/// External to the handler registry by design: handlers react to messages,
/// the driver reacts to time.
pub struct KeepaliveDriver {
    sessions: Arc<SessionTable>,
    registry: Arc<HandlerRegistry>,
    governors: Arc<GovernorPool>,
    local: EndpointId,
    config: KeepaliveConfig,
    event_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl KeepaliveDriver {
    pub fn new(
        sessions: Arc<SessionTable>,
        registry: Arc<HandlerRegistry>,
        governors: Arc<GovernorPool>,
        local: EndpointId,
        config: KeepaliveConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            sessions,
            registry,
            governors,
            local,
            config,
            event_tx,
            cancel,
        }
    }

    /// Subscribe to online/offline transitions. Events fire once per actual
    /// change; repeated missed pings stay silent.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// One driver pass: apply the timeout policy, then ping every session.
    pub async fn tick(&self) {
        let timeout = self.config.timeout();
        let now = Utc::now();
        let governor = self.governors.limiter(
            KEEPALIVE_GOVERNOR,
            GovernorConfig {
                max_concurrency: self.config.max_concurrent_pings,
            },
        );

        for device_id in self.sessions.devices() {
            let session = match self.sessions.get(&device_id) {
                Some(session) => session,
                None => continue,
            };

            let silent_for = (now - session.last_seen_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if silent_for > timeout {
                if self.sessions.set_status(&device_id, DeviceStatus::Offline) {
                    info!(device_id = %device_id, silent_ms = silent_for.as_millis() as u64, "device offline");
                    let _ = self.event_tx.send(SessionEvent::Offline(device_id.clone()));
                }
            } else if self.sessions.set_status(&device_id, DeviceStatus::Online) {
                info!(device_id = %device_id, "device online");
                let _ = self.event_tx.send(SessionEvent::Online(device_id.clone()));
            }

            let ping = Envelope::encode(
                MessageType::Ping,
                self.local.clone(),
                device_id.clone().into(),
                &PingPayload {
                    token: uuid::Uuid::new_v4().to_string(),
                    timestamp: Utc::now().timestamp_millis(),
                },
            );
            let ping = match ping {
                Ok(ping) => ping,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "failed to build ping");
                    continue;
                }
            };

            let emitter = Emitter::new(
                self.registry.clone(),
                device_id.clone(),
                self.cancel.clone(),
            );
            let outcome = governor.run(emitter.emit(ping)).await;
            match outcome {
                Ok(Ok(())) => {}
                // Transport failure does not flip status; only pong absence does.
                Ok(Err(e)) => {
                    warn!(device_id = %device_id, error = %e, "outbound ping failed, retrying next tick")
                }
                Err(e) => warn!(device_id = %device_id, error = %e, "keepalive governor closed"),
            }
        }
    }

    /// Run the driver until cancelled.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("keepalive driver stopped");
                        return;
                    }
                    _ = interval.tick() => self.tick().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_dispatch::Direction;
    use tunnel_transport::InMemoryTransport;
    use tunnel_types::DeviceId;

    struct NoTaskProbe;
    impl ContextProbe for NoTaskProbe {
        fn is_live(&self, _task_id: &TaskId) -> bool {
            false
        }
    }

    fn gateway() -> EndpointId {
        EndpointId::new("gateway")
    }

    fn build_registry(
        sessions: &Arc<SessionTable>,
        transport: &Arc<InMemoryTransport>,
    ) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                Direction::Income,
                MessageType::Ping,
                Arc::new(PingIncomeHandler::new(sessions.clone(), gateway())),
            )
            .unwrap();
        registry
            .register(
                Direction::Income,
                MessageType::Pong,
                Arc::new(PongIncomeHandler::new(sessions.clone())),
            )
            .unwrap();
        registry
            .register(
                Direction::Income,
                MessageType::ContextPing,
                Arc::new(ContextPingIncomeHandler::new(
                    sessions.clone(),
                    Arc::new(NoTaskProbe),
                    gateway(),
                )),
            )
            .unwrap();
        let transport_obj: Arc<dyn TunnelTransport> = transport.clone();
        let outcome = Arc::new(KeepaliveOutcomeHandler::new(transport_obj));
        for message_type in [
            MessageType::Ping,
            MessageType::Pong,
            MessageType::ContextPong,
        ] {
            registry
                .register(Direction::Outcome, message_type, outcome.clone())
                .unwrap();
        }
        Arc::new(registry)
    }

    fn ctx_for(registry: &Arc<HandlerRegistry>, device: &str) -> DispatchContext {
        DispatchContext::new(
            registry.clone(),
            DeviceId::new(device),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn income_ping_answers_with_echoed_token() {
        let sessions = Arc::new(SessionTable::new());
        let transport = Arc::new(InMemoryTransport::new());
        let registry = build_registry(&sessions, &transport);
        let ctx = ctx_for(&registry, "dev-1");

        let ping = Envelope::encode(
            MessageType::Ping,
            EndpointId::new("dev-1"),
            gateway(),
            &PingPayload {
                token: "tok-42".into(),
                timestamp: 123,
            },
        )
        .unwrap();
        registry
            .dispatch(Direction::Income, ping, &ctx)
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType::Pong);
        let pong: PingPayload = sent[0].decode_payload().unwrap();
        assert_eq!(pong.token, "tok-42");
        assert_eq!(pong.timestamp, 123);
        assert!(sessions.get(&DeviceId::new("dev-1")).is_some());
    }

    #[tokio::test]
    async fn context_ping_reports_task_liveness() {
        let sessions = Arc::new(SessionTable::new());
        let transport = Arc::new(InMemoryTransport::new());
        let registry = build_registry(&sessions, &transport);
        let ctx = ctx_for(&registry, "dev-1");

        let ping = Envelope::encode(
            MessageType::ContextPing,
            EndpointId::new("dev-1"),
            gateway(),
            &ContextPingPayload {
                task_id: TaskId::new("t1"),
                token: "c1".into(),
            },
        )
        .unwrap();
        registry
            .dispatch(Direction::Income, ping, &ctx)
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent[0].message_type, MessageType::ContextPong);
        let pong: ContextPongPayload = sent[0].decode_payload().unwrap();
        assert!(!pong.live);
        assert_eq!(pong.token, "c1");
    }

    fn fast_config() -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: 5,
            timeout_multiplier: 2,
            max_concurrent_pings: 4,
        }
    }

    #[tokio::test]
    async fn silent_device_goes_offline_exactly_once() {
        let sessions = Arc::new(SessionTable::new());
        let transport = Arc::new(InMemoryTransport::new());
        let registry = build_registry(&sessions, &transport);
        let driver = KeepaliveDriver::new(
            sessions.clone(),
            registry,
            Arc::new(GovernorPool::new()),
            gateway(),
            fast_config(),
            CancellationToken::new(),
        );
        let mut events = driver.subscribe();

        let dev = DeviceId::new("dev-1");
        sessions.touch(&dev);

        driver.tick().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Online(dev.clone()));

        // Let the timeout lapse, then observe it repeatedly.
        tokio::time::sleep(Duration::from_millis(25)).await;
        driver.tick().await;
        driver.tick().await;
        driver.tick().await;

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Offline(dev.clone())
        );
        assert!(events.try_recv().is_err());
        assert_eq!(sessions.get(&dev).unwrap().status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn failed_ping_send_does_not_flip_status() {
        let sessions = Arc::new(SessionTable::new());
        let transport = Arc::new(InMemoryTransport::new());
        let registry = build_registry(&sessions, &transport);
        let driver = KeepaliveDriver::new(
            sessions.clone(),
            registry,
            Arc::new(GovernorPool::new()),
            gateway(),
            fast_config(),
            CancellationToken::new(),
        );

        let dev = DeviceId::new("dev-1");
        sessions.touch(&dev);
        transport.fail_sends(true);

        driver.tick().await;

        assert_eq!(sessions.get(&dev).unwrap().status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn driver_pings_every_known_session() {
        let sessions = Arc::new(SessionTable::new());
        let transport = Arc::new(InMemoryTransport::new());
        let registry = build_registry(&sessions, &transport);
        let driver = KeepaliveDriver::new(
            sessions.clone(),
            registry,
            Arc::new(GovernorPool::new()),
            gateway(),
            fast_config(),
            CancellationToken::new(),
        );

        sessions.touch(&DeviceId::new("dev-1"));
        sessions.touch(&DeviceId::new("dev-2"));

        driver.tick().await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.message_type == MessageType::Ping));
    }
}
