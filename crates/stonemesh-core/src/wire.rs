//! Stonemesh wire format — on-air payload types for every mesh message.
//!
//! A mesh envelope is a single type byte followed by at most
//! `MAX_MESH_PAYLOAD` payload bytes. There is no length field: the payload
//! runs to the end of the frame and every type checks its own size.
//!
//! All payload structs are #[repr(C, packed)] with little-endian integer
//! fields and zerocopy derives, so encoding is a plain byte copy.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I16, I32, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Mesh node identifier. 0 addresses every node.
pub type StoneId = u8;

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type LeI16 = I16<LittleEndian>;
pub type LeI32 = I32<LittleEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Envelope header: the message type byte.
pub const MESH_HEADER_SIZE: usize = 1;

/// Largest envelope the transport carries in a single segmented publish
/// (three segments of 12 bytes, minus opcode and MIC overhead).
pub const MAX_MESH_MSG_SIZE: usize = 3 * 12 - 3 - 4;

/// Largest payload after the type byte.
pub const MAX_MESH_PAYLOAD: usize = MAX_MESH_MSG_SIZE - MESH_HEADER_SIZE;

/// Stone ID meaning "every node" in request framing.
pub const BROADCAST_ID: StoneId = 0;

/// Type byte used in a `Result` reply when the request type could not be read.
pub const TYPE_UNKNOWN: u8 = 0xFF;

/// Marker set on an aggregated external state once both parts merged.
pub const SERVICE_DATA_VALIDATION: u16 = 0xFA;

/// `TimeSync.flags` bit: sender claims to be the authoritative time root.
pub const TIME_SYNC_FLAG_OVERRIDE_ROOT: u8 = 0x01;

// ── Message Type ──────────────────────────────────────────────────────────────

/// Closed set of mesh message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Test = 0,
    Ack = 1,
    /// Current time broadcast. Refreshed from the clock at send time.
    StateTime = 2,
    /// Explicit "set time" command.
    CmdTime = 3,
    Noop = 4,
    MultiSwitch = 5,
    KeepAliveState = 6,
    KeepAlive = 7,
    State0 = 8,
    State1 = 9,
    ProfileLocation = 10,
    BehaviourSettings = 11,
    TrackedDeviceRegister = 12,
    TrackedDeviceToken = 13,
    TrackedDeviceListSize = 14,
    TrackedDeviceHeartbeat = 15,
    TimeSync = 16,
    StateSet = 17,
    StateGet = 18,
    Result = 19,
    ControlCommand = 20,
    NeighbourRssi = 21,
}

impl MessageType {
    pub const ALL: [MessageType; 22] = [
        MessageType::Test,
        MessageType::Ack,
        MessageType::StateTime,
        MessageType::CmdTime,
        MessageType::Noop,
        MessageType::MultiSwitch,
        MessageType::KeepAliveState,
        MessageType::KeepAlive,
        MessageType::State0,
        MessageType::State1,
        MessageType::ProfileLocation,
        MessageType::BehaviourSettings,
        MessageType::TrackedDeviceRegister,
        MessageType::TrackedDeviceToken,
        MessageType::TrackedDeviceListSize,
        MessageType::TrackedDeviceHeartbeat,
        MessageType::TimeSync,
        MessageType::StateSet,
        MessageType::StateGet,
        MessageType::Result,
        MessageType::ControlCommand,
        MessageType::NeighbourRssi,
    ];

    /// Payload layout expected for this type.
    pub const fn shape(self) -> PayloadShape {
        use core::mem::size_of;
        match self {
            MessageType::Test => PayloadShape::Fixed(size_of::<TestPayload>()),
            MessageType::Ack | MessageType::Noop | MessageType::KeepAlive => {
                PayloadShape::Fixed(0)
            }
            MessageType::StateTime | MessageType::CmdTime => {
                PayloadShape::Fixed(size_of::<TimePayload>())
            }
            MessageType::MultiSwitch => PayloadShape::Fixed(size_of::<MultiSwitchItem>()),
            MessageType::KeepAliveState => PayloadShape::Fixed(size_of::<KeepAliveStateItem>()),
            MessageType::State0 => PayloadShape::Fixed(size_of::<StatePart0>()),
            MessageType::State1 => PayloadShape::Fixed(size_of::<StatePart1>()),
            MessageType::ProfileLocation => PayloadShape::Fixed(size_of::<ProfileLocation>()),
            MessageType::BehaviourSettings => {
                PayloadShape::Fixed(size_of::<BehaviourSettings>())
            }
            MessageType::TrackedDeviceRegister => {
                PayloadShape::Fixed(size_of::<TrackedDeviceRegister>())
            }
            MessageType::TrackedDeviceToken => {
                PayloadShape::Fixed(size_of::<TrackedDeviceToken>())
            }
            MessageType::TrackedDeviceListSize => {
                PayloadShape::Fixed(size_of::<TrackedDeviceListSize>())
            }
            MessageType::TrackedDeviceHeartbeat => {
                PayloadShape::Fixed(size_of::<TrackedDeviceHeartbeat>())
            }
            MessageType::TimeSync => PayloadShape::Fixed(size_of::<TimeSync>()),
            MessageType::StateSet => PayloadShape::HeaderTail {
                header: size_of::<StateRequestHeader>(),
            },
            MessageType::StateGet => PayloadShape::Fixed(size_of::<StateRequestHeader>()),
            MessageType::Result => PayloadShape::HeaderTail {
                header: size_of::<ResultHeader>(),
            },
            MessageType::ControlCommand => PayloadShape::HeaderTail {
                header: size_of::<ControlCommandHeader>(),
            },
            MessageType::NeighbourRssi => PayloadShape::Fixed(size_of::<NeighbourRssi>()),
        }
    }

    /// Check a payload against this type's shape.
    pub fn check_payload_len(self, len: usize) -> Result<(), WireError> {
        if len > MAX_MESH_PAYLOAD {
            return Err(WireError::PayloadTooLarge(len));
        }
        match self.shape() {
            PayloadShape::Fixed(expected) if expected != len => Err(WireError::WrongPayloadSize {
                msg_type: self,
                expected,
                actual: len,
            }),
            PayloadShape::HeaderTail { header } if len < header => {
                Err(WireError::PayloadTooShort {
                    msg_type: self,
                    minimum: header,
                    actual: len,
                })
            }
            _ => Ok(()),
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::UnknownType(value))
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

/// How a type's payload size is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Payload must be exactly this many bytes.
    Fixed(usize),
    /// A fixed header followed by a tail running to the end of the frame.
    HeaderTail { header: usize },
}

// ── Time ──────────────────────────────────────────────────────────────────────

/// Payload of `StateTime` and `CmdTime`. Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TimePayload {
    /// Posix seconds.
    pub timestamp: Le32,
}

assert_eq_size!(TimePayload, [u8; 4]);

/// Time synchronisation broadcast. Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TimeSync {
    pub posix_s: Le32,
    pub posix_ms: Le16,
    /// Sync round, incremented by the root on every resync.
    pub version: Le16,
    /// Bit 0: `TIME_SYNC_FLAG_OVERRIDE_ROOT`. Bits 1-7 reserved.
    pub flags: u8,
}

assert_eq_size!(TimeSync, [u8; 9]);

// ── Test ──────────────────────────────────────────────────────────────────────

/// Counter message used to measure mesh loss. Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TestPayload {
    pub counter: Le32,
    pub dummy: [u8; 3],
}

assert_eq_size!(TestPayload, [u8; 7]);

// ── Switching ─────────────────────────────────────────────────────────────────

/// One switch command addressed to one node. Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MultiSwitchItem {
    pub stone_id: StoneId,
    /// 0 = off, 100 = fully on, 255 = toggle.
    pub switch_cmd: u8,
    /// Seconds before the switch is applied.
    pub delay: Le16,
    /// `SourceKind` byte.
    pub source_kind: u8,
    pub source_id: u8,
}

assert_eq_size!(MultiSwitchItem, [u8; 6]);

/// Keep-alive state for one node. Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct KeepAliveStateItem {
    pub stone_id: StoneId,
    /// 1 = switch to `switch_state` on timeout, 0 = no change.
    pub action: u8,
    /// Seconds without keep-alive before the action fires.
    pub timeout: Le16,
}

assert_eq_size!(KeepAliveStateItem, [u8; 4]);

// ── State broadcast ───────────────────────────────────────────────────────────

/// First half of a node's periodic state broadcast. Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StatePart0 {
    pub switch_state: u8,
    pub flags: u8,
    pub power_factor: i8,
    /// Real power in units of 1/8 W.
    pub power_usage_real: LeI16,
    /// Correlates part 0 with part 1. Compared raw.
    pub partial_timestamp: Le16,
}

assert_eq_size!(StatePart0, [u8; 7]);

/// Second half of a node's periodic state broadcast. Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StatePart1 {
    pub temperature: i8,
    /// Energy in units of 64 J.
    pub energy_used: LeI32,
    pub partial_timestamp: Le16,
}

assert_eq_size!(StatePart1, [u8; 7]);

// ── Presence and behaviour ────────────────────────────────────────────────────

/// Wire size: 2 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ProfileLocation {
    pub profile: u8,
    pub location: u8,
}

assert_eq_size!(ProfileLocation, [u8; 2]);

/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct BehaviourSettings {
    /// Bit 0: smart behaviour enabled. Other bits reserved.
    pub flags: Le32,
}

assert_eq_size!(BehaviourSettings, [u8; 4]);

// ── Tracked devices ───────────────────────────────────────────────────────────

/// Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TrackedDeviceRegister {
    pub device_id: Le16,
    pub location_id: u8,
    pub profile_id: u8,
    pub rssi_offset: i8,
    pub flags: u8,
    /// Compact access level of the registering user.
    pub access_level: u8,
}

assert_eq_size!(TrackedDeviceRegister, [u8; 7]);

/// Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TrackedDeviceToken {
    pub device_id: Le16,
    pub device_token: [u8; 3],
    pub ttl_minutes: Le16,
}

assert_eq_size!(TrackedDeviceToken, [u8; 7]);

/// Wire size: 1 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TrackedDeviceListSize {
    pub list_size: u8,
}

assert_eq_size!(TrackedDeviceListSize, [u8; 1]);

/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct TrackedDeviceHeartbeat {
    pub device_id: Le16,
    pub location_id: u8,
    pub ttl_minutes: u8,
}

assert_eq_size!(TrackedDeviceHeartbeat, [u8; 4]);

// ── Topology ──────────────────────────────────────────────────────────────────

/// RSSI of a direct neighbour as heard by the sender. Wire size: 3 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct NeighbourRssi {
    pub stone_id: StoneId,
    pub rssi: i8,
    pub channel: u8,
}

assert_eq_size!(NeighbourRssi, [u8; 3]);

// ── Requests and replies ──────────────────────────────────────────────────────

/// Header of `StateSet` (followed by the value) and `StateGet`.
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StateRequestHeader {
    /// Addressed node. `BROADCAST_ID` = every node.
    pub target_id: StoneId,
    pub state_type: u8,
    /// Instance of the state type, for types with several instances.
    pub state_id: u8,
    /// `PersistenceMode` byte.
    pub persistence: u8,
    /// Compact access level of the requester.
    pub access_level: u8,
    /// Compact command source.
    pub source: u8,
}

assert_eq_size!(StateRequestHeader, [u8; 6]);

/// Header of `ControlCommand`, followed by the command payload.
/// Wire size: 5 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ControlCommandHeader {
    pub target_id: StoneId,
    /// `CommandType` value.
    pub command_type: Le16,
    pub access_level: u8,
    pub source: u8,
}

assert_eq_size!(ControlCommandHeader, [u8; 5]);

/// Header of a `Result` reply, followed by type-specific echoed fields.
/// Wire size: 2 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ResultHeader {
    /// Type byte of the request being answered, or `TYPE_UNKNOWN`.
    pub msg_type: u8,
    /// `ReturnCode` byte.
    pub return_code: u8,
}

assert_eq_size!(ResultHeader, [u8; 2]);

/// How a state write is persisted by the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PersistenceMode {
    /// Let the state store pick per state type.
    Auto = 0,
    Ram = 1,
    Flash = 2,
    /// Read back the firmware default instead of the stored value.
    FirmwareDefault = 3,
}

impl TryFrom<u8> for PersistenceMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PersistenceMode::Auto),
            1 => Ok(PersistenceMode::Ram),
            2 => Ok(PersistenceMode::Flash),
            3 => Ok(PersistenceMode::FirmwareDefault),
            other => Err(WireError::UnknownPersistence(other)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the envelope header")]
    TooShort(usize),

    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("{msg_type:?} payload must be {expected} bytes, got {actual}")]
    WrongPayloadSize {
        msg_type: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("{msg_type:?} payload must be at least {minimum} bytes, got {actual}")]
    PayloadTooShort {
        msg_type: MessageType,
        minimum: usize,
        actual: usize,
    },

    #[error("payload length {0} exceeds maximum {}", MAX_MESH_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("unknown command type: {0}")]
    UnknownCommand(u16),

    #[error("unknown return code: 0x{0:02x}")]
    UnknownReturnCode(u8),

    #[error("unknown persistence mode: {0}")]
    UnknownPersistence(u8),

    #[error("unknown command source kind: {0}")]
    UnknownSourceKind(u8),
}

/// Read a fixed-size wire struct from the front of `bytes`.
pub(crate) fn read_prefix<T: FromBytes>(
    msg_type: MessageType,
    bytes: &[u8],
) -> Result<T, WireError> {
    T::read_from_prefix(bytes).ok_or(WireError::PayloadTooShort {
        msg_type,
        minimum: core::mem::size_of::<T>(),
        actual: bytes.len(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
