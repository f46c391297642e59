//! Events exchanged with the node's local event bus.

use bytes::Bytes;

use stonemesh_core::access::{AccessLevel, CmdSource};
use stonemesh_core::wire::{MessageType, StoneId};
use stonemesh_core::ReplyEnvelope;

use crate::aggregator::ExternalState;
use crate::transport::ReliableStatus;

/// Something the engine publishes on the local bus.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Every valid envelope, before any built-in handling.
    MessageReceived {
        msg_type: MessageType,
        payload: Bytes,
        source_id: StoneId,
        hops: u8,
        rssi: Option<i8>,
        reply_requested: bool,
    },
    /// Both state parts of a remote node merged.
    ExternalStoneState(ExternalState),
    /// Current time heard from the mesh.
    MeshTime { source_id: StoneId, timestamp: u32 },
    /// Explicit "set time" command.
    SetTime { timestamp: u32 },
    TimeSync {
        source_id: StoneId,
        posix_s: u32,
        posix_ms: u16,
        version: u16,
        override_root: bool,
    },
    /// A switch command addressed to this node.
    MultiSwitch {
        switch_cmd: u8,
        delay: u16,
        source: CmdSource,
    },
    KeepAliveState { action: u8, timeout: u16 },
    KeepAlive { source_id: StoneId },
    ProfileLocation {
        source_id: StoneId,
        profile: u8,
        location: u8,
    },
    BehaviourSettings { flags: u32 },
    TrackedDeviceRegister {
        device_id: u16,
        location_id: u8,
        profile_id: u8,
        rssi_offset: i8,
        flags: u8,
        access_level: AccessLevel,
    },
    TrackedDeviceToken {
        device_id: u16,
        device_token: [u8; 3],
        ttl_minutes: u16,
    },
    TrackedDeviceHeartbeat {
        device_id: u16,
        location_id: u8,
        ttl_minutes: u8,
    },
    TrackedDeviceListSize { source_id: StoneId, list_size: u8 },
    NeighbourRssi {
        reporter_id: StoneId,
        neighbour_id: StoneId,
        rssi: i8,
        channel: u8,
    },
    /// A `Result` reply arrived from another node.
    ResultReceived {
        source_id: StoneId,
        reply: ReplyEnvelope,
    },
    /// The in-flight reliable send finished.
    ReliableOutcome {
        msg_type: MessageType,
        target_id: StoneId,
        status: ReliableStatus,
    },
}

/// What the bus did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// A subscriber took ownership. Built-in handling is skipped and the
    /// subscriber's reply, if any, is sent instead.
    Claimed { reply: Option<ReplyEnvelope> },
    Unhandled,
}

/// The node's synchronous local event bus.
pub trait EventBus {
    fn dispatch(&mut self, event: &MeshEvent) -> Handled;
}
