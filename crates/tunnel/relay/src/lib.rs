//! Inference relay: the core of the tunnel.
//!
//! Request handlers correlate each accepted task, hand it to the engine
//! collaborator, and forward its output (chunk by chunk for streams, one
//! message for complete results) back through the outcome side of the
//! registry. The relay owns the guarantees: at most one active execution per
//! task id, strict chunk order within a task, exactly one terminal message,
//! and zero messages after cancellation.

#![deny(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod relay;
pub mod task;

pub use error::RelayError;
pub use handlers::{RelayOutcomeHandler, RequestIncomeHandler, ResponseIncomeHandler};
pub use relay::{InferenceRelay, RelayConfig, ResponseEvent};
pub use task::{TaskRecord, TaskState, TaskTable};
