//! Tunnel transport boundary primitives.
//!
//! Transport adapters are responsible only for delivery mechanics of whole
//! envelopes. Framing and reconnection live below this trait; a message-level
//! send failure is distinct from the connection being gone, because only the
//! latter feeds session liveness.

#![deny(unsafe_code)]

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tunnel_types::Envelope;

/// Trait for outbound transport adapters.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Message-level failure; the intent is preserved and may be retried.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The connection is gone; surfaced to liveness tracking, not retried
    /// per message.
    #[error("connection closed")]
    Closed,
}

/// Deterministic in-memory transport used for tests/dev. Records every sent
/// envelope and can be told to fail.
#[derive(Default)]
pub struct InMemoryTransport {
    sent: Mutex<Vec<Envelope>>,
    fail_sends: std::sync::atomic::AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All envelopes sent so far, in send order.
    pub async fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Make subsequent sends fail with [`TransportError::SendFailed`].
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelTransport for InMemoryTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "simulated transport failure for '{}'",
                envelope.to
            )));
        }
        self.sent.lock().await.push(envelope.clone());
        Ok(())
    }
}
