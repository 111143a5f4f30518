//! Relay errors.

use thiserror::Error;
use tunnel_types::{DeviceId, TaskId};

#[derive(Debug, Error)]
pub enum RelayError {
    /// Inference traffic before registration is rejected, never queued.
    #[error("device {0} is not registered")]
    NotRegistered(DeviceId),

    /// The same taskId maps to at most one active execution; the existing
    /// task is unaffected by the rejected duplicate.
    #[error("task {0} is already active")]
    DuplicateTask(TaskId),
}
