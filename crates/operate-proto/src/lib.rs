//! Wire definitions shared by the operate gateway, its remote agents and its
//! callers. Kept free of runtime code so other clients can depend on it
//! without pulling in tokio or axum.

pub mod agent;
pub mod envelope;

pub use agent::{
    AgentFrame, EventFrame, FrameError, RegisterAck, RegisterParams, RequestFrame, ResponseFrame,
    REGISTER_ACTION,
};
pub use envelope::{InboundEnvelope, InboundPayload, Meta, OutboundEnvelope, OutboundPayload, Status};

/// Generate a fresh opaque identifier.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
