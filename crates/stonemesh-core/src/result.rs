//! Return codes carried in `Result` replies, and the reply envelope itself.

use bytes::Bytes;

use crate::message::MeshMessage;
use crate::wire::{MessageType, ResultHeader, WireError, MAX_MESH_PAYLOAD};

/// Outcome of handling a mesh message, as reported back over the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    Success = 0x00,
    /// Accepted, the final outcome is published later.
    WaitForSuccess = 0x01,
    /// Accepted, but nothing changed (duplicate or same value).
    SuccessNoChange = 0x02,
    InvalidMessage = 0x10,
    WrongPayloadLength = 0x11,
    WrongParameter = 0x12,
    NoAccess = 0x20,
    NotFound = 0x30,
    WrongState = 0x31,
    QueueFull = 0x40,
    Busy = 0x41,
    Timeout = 0x42,
    Cancelled = 0x43,
    NotImplemented = 0x50,
    UnknownType = 0x51,
    Unspecified = 0xFF,
}

impl ReturnCode {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ReturnCode::Success | ReturnCode::WaitForSuccess | ReturnCode::SuccessNoChange
        )
    }
}

impl TryFrom<u8> for ReturnCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0x00 => ReturnCode::Success,
            0x01 => ReturnCode::WaitForSuccess,
            0x02 => ReturnCode::SuccessNoChange,
            0x10 => ReturnCode::InvalidMessage,
            0x11 => ReturnCode::WrongPayloadLength,
            0x12 => ReturnCode::WrongParameter,
            0x20 => ReturnCode::NoAccess,
            0x30 => ReturnCode::NotFound,
            0x31 => ReturnCode::WrongState,
            0x40 => ReturnCode::QueueFull,
            0x41 => ReturnCode::Busy,
            0x42 => ReturnCode::Timeout,
            0x43 => ReturnCode::Cancelled,
            0x50 => ReturnCode::NotImplemented,
            0x51 => ReturnCode::UnknownType,
            0xFF => ReturnCode::Unspecified,
            other => return Err(WireError::UnknownReturnCode(other)),
        };
        Ok(code)
    }
}

impl From<ReturnCode> for u8 {
    fn from(c: ReturnCode) -> u8 {
        c as u8
    }
}

impl From<WireError> for ReturnCode {
    fn from(e: WireError) -> Self {
        match e {
            WireError::PayloadTooLarge(_) => ReturnCode::WrongPayloadLength,
            WireError::UnknownCommand(_) => ReturnCode::UnknownType,
            WireError::UnknownPersistence(_) | WireError::UnknownSourceKind(_) => {
                ReturnCode::WrongParameter
            }
            _ => ReturnCode::InvalidMessage,
        }
    }
}

// ── Reply Envelope ────────────────────────────────────────────────────────────

/// Largest echo tail a reply can carry after its two header bytes.
pub const MAX_REPLY_TAIL: usize = MAX_MESH_PAYLOAD - core::mem::size_of::<ResultHeader>();

/// Answer to a request, sent back as a `Result` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// Type byte of the request, or `TYPE_UNKNOWN`.
    pub original_type: u8,
    pub return_code: ReturnCode,
    /// Type-specific echoed fields. At most `MAX_REPLY_TAIL` bytes.
    pub payload: Bytes,
}

impl ReplyEnvelope {
    pub fn new(original_type: impl Into<u8>, return_code: ReturnCode) -> Self {
        Self {
            original_type: original_type.into(),
            return_code,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Type of the answered request, if it was readable.
    pub fn request_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.original_type).ok()
    }

    pub fn to_message(&self) -> MeshMessage {
        MeshMessage::Result {
            header: ResultHeader {
                msg_type: self.original_type,
                return_code: self.return_code.into(),
            },
            payload: self.payload.clone(),
        }
    }

    /// Interpret a received `Result` message.
    pub fn from_message(msg: &MeshMessage) -> Option<Result<Self, WireError>> {
        match msg {
            MeshMessage::Result { header, payload } => Some(
                ReturnCode::try_from(header.return_code).map(|return_code| Self {
                    original_type: header.msg_type,
                    return_code,
                    payload: payload.clone(),
                }),
            ),
            _ => None,
        }
    }
}
