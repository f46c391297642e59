//! stonemesh-core — mesh wire format, message codec, and shared protocol types.
//! All other Stonemesh crates depend on this one.

pub mod access;
pub mod config;
pub mod message;
pub mod result;
pub mod wire;

pub use access::{AccessLevel, CmdSource, CommandType, SourceKind};
pub use message::{Frame, MeshMessage};
pub use result::{ReplyEnvelope, ReturnCode};
pub use wire::{MessageType, StoneId, WireError};
