//! Access levels, command sources, and control command types.
//!
//! Requests over the mesh carry the requester's access level and the source
//! of the command in one byte each. They are inflated to `AccessLevel` and
//! `CmdSource` before any permission check.

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

// ── Access Level ──────────────────────────────────────────────────────────────

/// Permission tier. Among user levels, a lower value is more privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AccessLevel {
    Admin = 0,
    Member = 1,
    Basic = 2,
    Setup = 100,
    ServiceData = 101,
    Localization = 102,
    NotSet = 201,
    EncryptionDisabled = 254,
    NoOne = 255,
}

impl AccessLevel {
    /// Expand the compact wire encoding. Unknown values inflate to `NotSet`,
    /// which no permission check accepts.
    pub fn inflate(compact: u8) -> Self {
        match compact {
            0 => AccessLevel::Admin,
            1 => AccessLevel::Member,
            2 => AccessLevel::Basic,
            3 => AccessLevel::Setup,
            _ => AccessLevel::NotSet,
        }
    }

    /// Compact wire encoding. Only levels a requester can hold are encodable.
    pub fn shorten(self) -> Option<u8> {
        match self {
            AccessLevel::Admin => Some(0),
            AccessLevel::Member => Some(1),
            AccessLevel::Basic => Some(2),
            AccessLevel::Setup => Some(3),
            _ => None,
        }
    }

    /// Whether `provided` satisfies `self` as a requirement.
    ///
    /// With encryption disabled every request is allowed.
    pub fn permits(self, provided: AccessLevel, encryption_enabled: bool) -> bool {
        if !encryption_enabled {
            return true;
        }
        match self {
            AccessLevel::NotSet | AccessLevel::NoOne => false,
            AccessLevel::EncryptionDisabled => true,
            AccessLevel::Setup => provided == AccessLevel::Setup,
            required => match provided {
                AccessLevel::Admin | AccessLevel::Member | AccessLevel::Basic => {
                    (provided as u8) <= (required as u8)
                }
                _ => false,
            },
        }
    }
}

// ── Command Source ────────────────────────────────────────────────────────────

/// Kind of a command source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SourceKind {
    /// `id` is one of the `SOURCE_ID_*` constants.
    Enum = 0,
    /// `id` is a behaviour index.
    Behaviour = 1,
    /// `id` is a broadcasting device id.
    Broadcast = 2,
}

impl TryFrom<u8> for SourceKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SourceKind::Enum),
            1 => Ok(SourceKind::Behaviour),
            2 => Ok(SourceKind::Broadcast),
            other => Err(WireError::UnknownSourceKind(other)),
        }
    }
}

pub const SOURCE_ID_NONE: u8 = 0;
pub const SOURCE_ID_INTERNAL: u8 = 1;
pub const SOURCE_ID_CONNECTION: u8 = 2;
pub const SOURCE_ID_UART: u8 = 3;
pub const SOURCE_ID_SWITCHCRAFT: u8 = 4;
pub const SOURCE_ID_TAP_TO_TOGGLE: u8 = 5;

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdSource {
    pub kind: SourceKind,
    pub id: u8,
    /// Set once the command arrived over the mesh.
    pub external: bool,
}

impl CmdSource {
    pub const fn new(kind: SourceKind, id: u8) -> Self {
        Self {
            kind,
            id,
            external: false,
        }
    }

    pub const fn internal() -> Self {
        Self::new(SourceKind::Enum, SOURCE_ID_INTERNAL)
    }

    /// Expand `(kind << 5) | id`. The result is always marked external.
    pub fn inflate(compact: u8) -> Result<Self, WireError> {
        let kind = SourceKind::try_from(compact >> 5)?;
        Ok(Self {
            kind,
            id: compact & 0x1F,
            external: true,
        })
    }

    /// Compact encoding; `None` if `id` needs more than five bits.
    pub fn shorten(&self) -> Option<u8> {
        if self.id > 0x1F {
            return None;
        }
        Some(((self.kind as u8) << 5) | self.id)
    }

    /// Commands from a phone connection or UART get extra mesh repeats.
    pub fn is_user_facing(&self) -> bool {
        self.kind == SourceKind::Enum
            && (self.id == SOURCE_ID_CONNECTION || self.id == SOURCE_ID_UART)
    }
}

// ── Command Type ──────────────────────────────────────────────────────────────

/// Control commands a node can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandType {
    Setup = 0,
    FactoryReset = 1,
    StateGet = 2,
    StateSet = 3,
    Reset = 10,
    GotoDfu = 11,
    Nop = 12,
    Disconnect = 13,
    Switch = 20,
    MultiSwitch = 21,
    Pwm = 22,
    Relay = 23,
    SetTime = 30,
    IncreaseTx = 31,
    ResetErrors = 32,
    MeshCommand = 33,
    SetSunTime = 34,
    AllowDimming = 40,
    LockSwitch = 41,
    UartMsg = 50,
}

impl CommandType {
    /// Minimum access level a requester needs to run this command.
    pub fn required_access(self) -> AccessLevel {
        match self {
            CommandType::Setup | CommandType::IncreaseTx => AccessLevel::Setup,
            CommandType::Switch
            | CommandType::Pwm
            | CommandType::Relay
            | CommandType::Disconnect
            | CommandType::Nop
            | CommandType::MultiSwitch
            | CommandType::MeshCommand
            | CommandType::StateGet
            | CommandType::StateSet => AccessLevel::Basic,
            CommandType::SetTime | CommandType::SetSunTime => AccessLevel::Member,
            CommandType::FactoryReset
            | CommandType::Reset
            | CommandType::GotoDfu
            | CommandType::ResetErrors
            | CommandType::AllowDimming
            | CommandType::LockSwitch
            | CommandType::UartMsg => AccessLevel::Admin,
        }
    }

    /// Whether this command may arrive as a mesh `ControlCommand` at all.
    pub fn allowed_over_mesh(self) -> bool {
        matches!(
            self,
            CommandType::Switch
                | CommandType::Pwm
                | CommandType::Relay
                | CommandType::SetTime
                | CommandType::Reset
                | CommandType::FactoryReset
                | CommandType::ResetErrors
                | CommandType::UartMsg
        )
    }
}

impl TryFrom<u16> for CommandType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let cmd = match value {
            0 => CommandType::Setup,
            1 => CommandType::FactoryReset,
            2 => CommandType::StateGet,
            3 => CommandType::StateSet,
            10 => CommandType::Reset,
            11 => CommandType::GotoDfu,
            12 => CommandType::Nop,
            13 => CommandType::Disconnect,
            20 => CommandType::Switch,
            21 => CommandType::MultiSwitch,
            22 => CommandType::Pwm,
            23 => CommandType::Relay,
            30 => CommandType::SetTime,
            31 => CommandType::IncreaseTx,
            32 => CommandType::ResetErrors,
            33 => CommandType::MeshCommand,
            34 => CommandType::SetSunTime,
            40 => CommandType::AllowDimming,
            41 => CommandType::LockSwitch,
            50 => CommandType::UartMsg,
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(cmd)
    }
}

impl From<CommandType> for u16 {
    fn from(c: CommandType) -> u16 {
        c as u16
    }
}
