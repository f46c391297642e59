//! Remote command relay — state set/get and control commands over the mesh.
//!
//! Receiving side: a request names its target node, the requester's compact
//! access level and the compact command source. Both are inflated, the
//! permission checks run, and only then is the request executed. Every
//! executed request answers with a `Result` that echoes the request header.
//!
//! Origin side: a command addressed to a set of nodes (empty = every node)
//! runs locally if this node is included, and is forwarded to the mesh for
//! everyone else.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;
use zerocopy::AsBytes;

use stonemesh_core::access::{AccessLevel, CmdSource, CommandType};
use stonemesh_core::result::MAX_REPLY_TAIL;
use stonemesh_core::wire::{
    ControlCommandHeader, Le16, MessageType, PersistenceMode, StateRequestHeader, StoneId,
    BROADCAST_ID,
};
use stonemesh_core::{MeshMessage, ReplyEnvelope, ReturnCode};

use crate::error::EngineError;
use crate::local::{LocalServices, StateKey, StateOp};
use crate::reliable::ReliableSender;
use crate::sender::MeshSender;
use crate::transport::{MeshTransport, ReliableStatus};

/// A request to run on one or more nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    Control {
        command: CommandType,
        payload: Bytes,
    },
    StateSet {
        key: StateKey,
        persistence: PersistenceMode,
        value: Bytes,
    },
    StateGet {
        key: StateKey,
        persistence: PersistenceMode,
    },
}

/// A request plus the nodes it is addressed to.
#[derive(Debug, Clone)]
pub struct MeshCommand {
    /// Empty = every node.
    pub target_ids: Vec<StoneId>,
    pub request: RemoteRequest,
    pub access: AccessLevel,
    pub source: CmdSource,
    /// Use the reliable adapter when exactly one remote node is addressed.
    pub reliable: bool,
}

/// What `CommandRelay::send_command` did.
#[derive(Debug, Default)]
pub struct CommandDispatch {
    /// Reply of the local execution, if this node was addressed.
    pub local: Option<ReplyEnvelope>,
    /// Targets queued for the mesh. `BROADCAST_ID` = every node.
    pub forwarded: Vec<StoneId>,
    /// Completion of the reliable send, if one was used.
    pub pending: Option<oneshot::Receiver<ReliableStatus>>,
}

pub struct CommandRelay {
    own_id: StoneId,
    forward_repeats: u8,
}

impl CommandRelay {
    pub fn new(own_id: StoneId, forward_repeats: u8) -> Self {
        Self {
            own_id,
            forward_repeats,
        }
    }

    fn addressed(&self, target_id: StoneId) -> bool {
        target_id == BROADCAST_ID || target_id == self.own_id
    }

    // ── Receiving side ────────────────────────────────────────────────────────

    /// Handle a request that arrived over the mesh. Returns `None` for
    /// requests addressed to another node and for non-request types.
    pub fn handle(&self, msg: &MeshMessage, services: &mut LocalServices) -> Option<ReplyEnvelope> {
        let (target_id, access, source) = match msg {
            MeshMessage::StateSet { header, .. } | MeshMessage::StateGet(header) => {
                (header.target_id, header.access_level, header.source)
            }
            MeshMessage::ControlCommand { header, .. } => {
                (header.target_id, header.access_level, header.source)
            }
            _ => return None,
        };
        if !self.addressed(target_id) {
            tracing::trace!(target_id, own_id = self.own_id, "request for another node");
            return None;
        }

        let access = AccessLevel::inflate(access);
        let source = match CmdSource::inflate(source) {
            Ok(source) => source,
            Err(e) => {
                tracing::debug!(error = %e, "request with invalid source");
                return Some(ReplyEnvelope::new(msg.msg_type(), ReturnCode::InvalidMessage));
            }
        };
        self.execute(msg, access, source, services)
    }

    /// Run a request locally with already inflated credentials.
    fn execute(
        &self,
        msg: &MeshMessage,
        access: AccessLevel,
        source: CmdSource,
        services: &mut LocalServices,
    ) -> Option<ReplyEnvelope> {
        match msg {
            MeshMessage::StateSet { header, value } => {
                let code = self.state_set(header, value, access, services);
                Some(ReplyEnvelope::new(MessageType::StateSet, code).with_payload(
                    Bytes::copy_from_slice(header.as_bytes()),
                ))
            }
            MeshMessage::StateGet(header) => {
                let (code, value) = self.state_get(header, access, services);
                let mut echo = BytesMut::with_capacity(MAX_REPLY_TAIL);
                echo.put_slice(header.as_bytes());
                echo.put_slice(&value);
                Some(ReplyEnvelope::new(MessageType::StateGet, code).with_payload(echo.freeze()))
            }
            MeshMessage::ControlCommand { header, payload } => {
                let command_type = header.command_type.get();
                let (code, data) = self.control(command_type, payload, access, source, services);
                let mut echo = BytesMut::with_capacity(MAX_REPLY_TAIL);
                echo.put_u16_le(command_type);
                let room = MAX_REPLY_TAIL - echo.len();
                if data.len() > room {
                    tracing::warn!(command_type, len = data.len(), room, "command result truncated");
                }
                echo.put_slice(&data[..data.len().min(room)]);
                Some(
                    ReplyEnvelope::new(MessageType::ControlCommand, code)
                        .with_payload(echo.freeze()),
                )
            }
            _ => None,
        }
    }

    fn state_set(
        &self,
        header: &StateRequestHeader,
        value: &[u8],
        access: AccessLevel,
        services: &mut LocalServices,
    ) -> ReturnCode {
        let persistence = match PersistenceMode::try_from(header.persistence) {
            Ok(p) => p,
            Err(_) => return ReturnCode::WrongParameter,
        };
        if !self.state_permitted(header.state_type, StateOp::Set, access, services) {
            return ReturnCode::NoAccess;
        }
        let key = StateKey {
            state_type: header.state_type,
            state_id: header.state_id,
        };
        let code = services.store.set_state(key, value, persistence);
        tracing::debug!(
            state_type = key.state_type,
            state_id = key.state_id,
            value = hex::encode(value),
            ?code,
            "mesh state set"
        );
        code
    }

    fn state_get(
        &self,
        header: &StateRequestHeader,
        access: AccessLevel,
        services: &mut LocalServices,
    ) -> (ReturnCode, Bytes) {
        let persistence = match PersistenceMode::try_from(header.persistence) {
            Ok(p) => p,
            Err(_) => return (ReturnCode::WrongParameter, Bytes::new()),
        };
        if !self.state_permitted(header.state_type, StateOp::Get, access, services) {
            return (ReturnCode::NoAccess, Bytes::new());
        }
        let key = StateKey {
            state_type: header.state_type,
            state_id: header.state_id,
        };
        match services.store.get_state(key, persistence) {
            Ok(value) if value.len() + header.as_bytes().len() > MAX_REPLY_TAIL => {
                (ReturnCode::WrongPayloadLength, Bytes::new())
            }
            Ok(value) => (ReturnCode::Success, value),
            Err(code) => (code, Bytes::new()),
        }
    }

    /// Outer check on the generic state command, then the per-type check.
    fn state_permitted(
        &self,
        state_type: u8,
        op: StateOp,
        access: AccessLevel,
        services: &LocalServices,
    ) -> bool {
        let command = match op {
            StateOp::Get => CommandType::StateGet,
            StateOp::Set => CommandType::StateSet,
        };
        let outer = services.permissions.required_command_access(command);
        let nested = services.permissions.required_state_access(state_type, op);
        let permitted = services.permissions.allowed(outer, access)
            && services.permissions.allowed(nested, access);
        if !permitted {
            tracing::info!(state_type, ?op, ?access, ?outer, ?nested, "state access denied");
        }
        permitted
    }

    fn control(
        &self,
        command_type: u16,
        payload: &[u8],
        access: AccessLevel,
        source: CmdSource,
        services: &mut LocalServices,
    ) -> (ReturnCode, Bytes) {
        let command = match CommandType::try_from(command_type) {
            Ok(c) => c,
            Err(e) => return (ReturnCode::from(e), Bytes::new()),
        };
        if !command.allowed_over_mesh() {
            tracing::info!(?command, "command not allowed over mesh");
            return (ReturnCode::NoAccess, Bytes::new());
        }
        let required = services.permissions.required_command_access(command);
        if !services.permissions.allowed(required, access) {
            tracing::info!(?command, ?access, ?required, "command access denied");
            return (ReturnCode::NoAccess, Bytes::new());
        }
        let outcome = services.executor.execute(command, payload, access, source);
        tracing::debug!(?command, code = ?outcome.code, "mesh command executed");
        (outcome.code, outcome.data)
    }

    // ── Origin side ───────────────────────────────────────────────────────────

    /// Run `cmd` on every addressed node: locally at most once, and through
    /// the mesh for the rest.
    ///
    /// `Busy` and `QueueFull` are returned before anything runs or is
    /// queued, so the caller can re-issue the same command.
    pub fn send_command(
        &self,
        cmd: MeshCommand,
        services: &mut LocalServices,
        sender: &mut MeshSender,
        reliable: &mut ReliableSender,
        transport: &mut dyn MeshTransport,
    ) -> Result<CommandDispatch, EngineError> {
        let access = cmd
            .access
            .shorten()
            .ok_or(EngineError::WrongParameter("access level cannot be sent"))?;
        let source = cmd
            .source
            .shorten()
            .ok_or(EngineError::WrongParameter("command source cannot be sent"))?;

        let mut remote: Vec<StoneId> = Vec::new();
        for &id in &cmd.target_ids {
            if id != self.own_id && id != BROADCAST_ID && !remote.contains(&id) {
                remote.push(id);
            }
        }
        let run_local = cmd.target_ids.is_empty()
            || cmd.target_ids.contains(&self.own_id)
            || cmd.target_ids.contains(&BROADCAST_ID);
        let broadcast = cmd.target_ids.is_empty() || cmd.target_ids.contains(&BROADCAST_ID);

        // Build every frame first so an oversized request fails before any
        // side effect.
        let local_msg = build(&cmd.request, self.own_id, access, source);
        local_msg.encode()?;

        let use_reliable = !broadcast && cmd.reliable && remote.len() == 1;
        let queued: Vec<StoneId> = if broadcast {
            vec![BROADCAST_ID]
        } else if use_reliable {
            Vec::new()
        } else {
            remote.clone()
        };

        // Nothing may refuse the forward after the local run.
        if use_reliable && (reliable.is_busy() || !transport.reliable_slot_free()) {
            tracing::debug!(target_id = remote[0], "reliable slot busy, command not run");
            return Err(EngineError::Busy);
        }
        if !queued.is_empty() && self.forward_repeats == 0 {
            return Err(EngineError::ZeroRepeats);
        }
        let keys: Vec<(MessageType, u16)> = queued
            .iter()
            .map(|&target| (local_msg.msg_type(), queue_key(&cmd.request, target)))
            .collect();
        if !sender.queue().has_room_for(&keys) {
            tracing::warn!(targets = ?queued, "no queue room for mesh command, command not run");
            return Err(EngineError::QueueFull);
        }

        let mut dispatch = CommandDispatch::default();
        if use_reliable {
            let target = remote[0];
            let msg = build(&cmd.request, target, access, source);
            dispatch.pending = Some(reliable.send(target, &msg, transport)?);
            dispatch.forwarded.push(target);
        }
        for &target in &queued {
            let msg = build(&cmd.request, target, access, source);
            sender.enqueue(&msg, queue_key(&cmd.request, target), self.forward_repeats, true)?;
            dispatch.forwarded.push(target);
        }

        if run_local {
            dispatch.local = self.execute(&local_msg, cmd.access, cmd.source, services);
        }

        tracing::debug!(
            targets = ?cmd.target_ids,
            local = run_local,
            forwarded = ?dispatch.forwarded,
            "mesh command dispatched"
        );
        Ok(dispatch)
    }
}

fn build(request: &RemoteRequest, target_id: StoneId, access: u8, source: u8) -> MeshMessage {
    match request {
        RemoteRequest::Control { command, payload } => MeshMessage::ControlCommand {
            header: ControlCommandHeader {
                target_id,
                command_type: Le16::new((*command).into()),
                access_level: access,
                source,
            },
            payload: payload.clone(),
        },
        RemoteRequest::StateSet {
            key,
            persistence,
            value,
        } => MeshMessage::StateSet {
            header: state_header(target_id, key, *persistence, access, source),
            value: value.clone(),
        },
        RemoteRequest::StateGet { key, persistence } => {
            MeshMessage::StateGet(state_header(target_id, key, *persistence, access, source))
        }
    }
}

fn state_header(
    target_id: StoneId,
    key: &StateKey,
    persistence: PersistenceMode,
    access: u8,
    source: u8,
) -> StateRequestHeader {
    StateRequestHeader {
        target_id,
        state_type: key.state_type,
        state_id: key.state_id,
        persistence: persistence as u8,
        access_level: access,
        source,
    }
}

/// Queue key: the target in the low byte, the command or state type above it,
/// so requests of different kinds to one node do not replace each other.
fn queue_key(request: &RemoteRequest, target_id: StoneId) -> u16 {
    let kind = match request {
        RemoteRequest::Control { command, .. } => u16::from(*command) as u8,
        RemoteRequest::StateSet { key, .. } | RemoteRequest::StateGet { key, .. } => {
            key.state_type
        }
    };
    ((kind as u16) << 8) | target_id as u16
}
