use stonemesh_core::WireError;

use crate::transport::TransportError;

/// Errors returned synchronously to in-process callers of the engine.
/// None of them are retried by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("outgoing queue is full")]
    QueueFull,

    #[error("a reliable send is already in flight")]
    Busy,

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] WireError),

    #[error("repeat count must be non-zero")]
    ZeroRepeats,

    #[error("wrong parameter: {0}")]
    WrongParameter(&'static str),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
