//! Configuration for the tunnel service.

use serde::{Deserialize, Serialize};
use tunnel_relay::RelayConfig;
use tunnel_session::KeepaliveConfig;

/// Complete tunnel configuration, one section per concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Identifier this endpoint writes into the `from` field of everything
    /// it sends.
    pub local_endpoint: String,
    pub keepalive: KeepaliveConfig,
    pub relay: RelayConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_endpoint: "gateway".to_string(),
            keepalive: KeepaliveConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}
