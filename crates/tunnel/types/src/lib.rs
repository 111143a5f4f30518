//! Tunnel wire types.
//!
//! The unit of exchange on the tunnel is the [`Envelope`]: a typed JSON
//! document carrying addressing and a type-specific payload. The message
//! type enumeration is closed; adding a type is an explicit change here,
//! never inferred from payload shape.

#![deny(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod ids;
pub mod message;
pub mod payload;

pub use envelope::Envelope;
pub use error::ValidationError;
pub use ids::{DeviceId, EndpointId, TaskId};
pub use message::{MessageFamily, MessageType};
pub use payload::{
    ChatMessage, ContextPingPayload, ContextPongPayload, InferenceRequest, InferenceResponse,
    PingPayload, RegistrationAck, RegistrationBody, RegistrationPayload, ResponseChunk, Usage,
    DEFAULT_CHAT_PATH, DEFAULT_COMPLETION_PATH,
};
