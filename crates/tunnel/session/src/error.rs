//! Session errors.

use thiserror::Error;
use tunnel_types::DeviceId;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Registration validation failed. A negative ack is emitted and the
    /// session stays unregistered.
    #[error("registration rejected for {device_id}: {reason}")]
    RegistrationRejected { device_id: DeviceId, reason: String },
}
