//! Tunnel service orchestration.
//!
//! Assembles the protocol core (session table, task table, handler
//! registry, governors, keepalive driver) from one [`TunnelConfig`] and
//! runs the inbound dispatch loop. The HTTP controller and the real
//! transport plug in from outside; everything here works against their
//! traits.

#![deny(unsafe_code)]

pub mod config;
pub mod service;

pub use config::TunnelConfig;
pub use service::TunnelService;
