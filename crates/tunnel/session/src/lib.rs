//! Device sessions: liveness and registration.
//!
//! One [`session::DeviceSession`] exists per device that has ever contacted
//! the gateway. Sessions are created on first contact and persist across
//! reconnects; only their status changes. The keepalive subsystem drives
//! online/offline transitions, the registration flow gates inference traffic.

#![deny(unsafe_code)]

pub mod error;
pub mod keepalive;
pub mod registration;
pub mod session;

pub use error::SessionError;
pub use keepalive::{
    ContextPingIncomeHandler, ContextPongIncomeHandler, ContextProbe, KeepaliveConfig,
    KeepaliveDriver, KeepaliveOutcomeHandler, PingIncomeHandler, PongIncomeHandler,
};
pub use registration::{RegistrationIncomeHandler, RegistrationOutcomeHandler};
pub use session::{DeviceSession, DeviceStatus, RegistrationState, SessionEvent, SessionTable};
