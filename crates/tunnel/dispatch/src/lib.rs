//! Tunnel dispatch core.
//!
//! Inbound flow: raw document → [`normalize`] → envelope validation →
//! [`HandlerRegistry`] lookup by (direction, type) → handler. Dispatch is a
//! pure routing step; all per-type behavior lives in the registered handlers.

#![deny(unsafe_code)]

pub mod context;
pub mod error;
pub mod normalize;
pub mod registry;

pub use context::{DispatchContext, Emitter};
pub use error::{DispatchError, NormalizeError};
pub use normalize::normalize;
pub use registry::{Direction, HandlerRegistry, MessageHandler};
