//! Local collaborators of the engine: clock, state store, command executor,
//! and the permission oracle.

use std::collections::HashMap;

use bytes::Bytes;

use stonemesh_core::access::{AccessLevel, CmdSource, CommandType};
use stonemesh_core::config::StonemeshConfig;
use stonemesh_core::wire::PersistenceMode;
use stonemesh_core::ReturnCode;

use crate::event::EventBus;

/// Wall clock. Returns 0 while the time is unknown.
pub trait Clock {
    fn now_posix(&self) -> u32;
}

/// Identifies one state value: a state type and its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub state_type: u8,
    pub state_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOp {
    Get,
    Set,
}

/// Persistent state storage. Failures are reported as return codes and
/// relayed verbatim to the requester.
pub trait StateStore {
    fn set_state(&mut self, key: StateKey, value: &[u8], persistence: PersistenceMode)
        -> ReturnCode;
    fn get_state(&mut self, key: StateKey, persistence: PersistenceMode)
        -> Result<Bytes, ReturnCode>;
}

/// Result of running a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub code: ReturnCode,
    pub data: Bytes,
}

impl CommandOutcome {
    pub fn code(code: ReturnCode) -> Self {
        Self {
            code,
            data: Bytes::new(),
        }
    }
}

/// Runs control commands on this node.
pub trait CommandExecutor {
    fn execute(
        &mut self,
        command: CommandType,
        payload: &[u8],
        access: AccessLevel,
        source: CmdSource,
    ) -> CommandOutcome;
}

/// Decides which access level each request needs.
pub trait PermissionOracle {
    fn required_command_access(&self, command: CommandType) -> AccessLevel {
        command.required_access()
    }

    fn required_state_access(&self, state_type: u8, op: StateOp) -> AccessLevel;

    fn allowed(&self, required: AccessLevel, provided: AccessLevel) -> bool;
}

// ── Default permissions ───────────────────────────────────────────────────────

/// Command access from `CommandType::required_access`, state access from
/// config overrides with Member-get/Admin-set as the fallback.
#[derive(Debug, Clone)]
pub struct DefaultPermissions {
    encryption_enabled: bool,
    state_overrides: HashMap<u8, (AccessLevel, AccessLevel)>,
}

impl DefaultPermissions {
    pub fn new(encryption_enabled: bool) -> Self {
        Self {
            encryption_enabled,
            state_overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &StonemeshConfig) -> Self {
        let mut permissions = Self::new(config.node.encryption_enabled);
        for o in &config.access.state_overrides {
            permissions.state_overrides.insert(o.state_type, (o.get, o.set));
        }
        permissions
    }

    pub fn with_state_access(mut self, state_type: u8, get: AccessLevel, set: AccessLevel) -> Self {
        self.state_overrides.insert(state_type, (get, set));
        self
    }
}

impl PermissionOracle for DefaultPermissions {
    fn required_state_access(&self, state_type: u8, op: StateOp) -> AccessLevel {
        let (get, set) = self
            .state_overrides
            .get(&state_type)
            .copied()
            .unwrap_or((AccessLevel::Member, AccessLevel::Admin));
        match op {
            StateOp::Get => get,
            StateOp::Set => set,
        }
    }

    fn allowed(&self, required: AccessLevel, provided: AccessLevel) -> bool {
        required.permits(provided, self.encryption_enabled)
    }
}

// ── In-memory state store ─────────────────────────────────────────────────────

/// State store backed by a map. Every persistence mode is kept in RAM.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: HashMap<StateKey, Bytes>,
    defaults: HashMap<StateKey, Bytes>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a firmware default, returned for `FirmwareDefault` reads and
    /// for keys never written.
    pub fn with_default(mut self, key: StateKey, value: impl Into<Bytes>) -> Self {
        self.defaults.insert(key, value.into());
        self
    }

    pub fn value(&self, key: StateKey) -> Option<&Bytes> {
        self.values.get(&key)
    }
}

impl StateStore for MemoryStateStore {
    fn set_state(
        &mut self,
        key: StateKey,
        value: &[u8],
        persistence: PersistenceMode,
    ) -> ReturnCode {
        if persistence == PersistenceMode::FirmwareDefault {
            return ReturnCode::WrongParameter;
        }
        if let Some(expected) = self.defaults.get(&key) {
            if expected.len() != value.len() {
                return ReturnCode::WrongPayloadLength;
            }
        }
        if self.values.get(&key).map(|v| &v[..]) == Some(value) {
            return ReturnCode::SuccessNoChange;
        }
        self.values.insert(key, Bytes::copy_from_slice(value));
        ReturnCode::Success
    }

    fn get_state(
        &mut self,
        key: StateKey,
        persistence: PersistenceMode,
    ) -> Result<Bytes, ReturnCode> {
        let stored = match persistence {
            PersistenceMode::FirmwareDefault => None,
            _ => self.values.get(&key),
        };
        stored
            .or_else(|| self.defaults.get(&key))
            .cloned()
            .ok_or(ReturnCode::NotFound)
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// Everything on the node that the engine talks to, besides the transport.
pub struct LocalServices {
    pub bus: Box<dyn EventBus>,
    pub store: Box<dyn StateStore>,
    pub executor: Box<dyn CommandExecutor>,
    pub clock: Box<dyn Clock>,
    pub permissions: Box<dyn PermissionOracle>,
}
