//! Typed outbound API over the outgoing queue.
//!
//! Every other subsystem puts messages on the mesh through `MeshSender`. It
//! picks the queue key, repeat count and priority per message type so callers
//! only supply content.

use zerocopy::AsBytes;

use stonemesh_core::access::{CmdSource, SourceKind};
use stonemesh_core::config::RepeatConfig;
use stonemesh_core::wire::{
    BehaviourSettings, KeepAliveStateItem, Le16, Le32, LeI16, LeI32, MessageType,
    MultiSwitchItem, NeighbourRssi, ProfileLocation, StatePart0, StatePart1, StoneId,
    TestPayload, TimePayload, TimeSync, TrackedDeviceHeartbeat, TrackedDeviceListSize,
    TrackedDeviceRegister, TrackedDeviceToken, TIME_SYNC_FLAG_OVERRIDE_ROOT,
};
use stonemesh_core::MeshMessage;

use crate::error::EngineError;
use crate::local::Clock;
use crate::outgoing::OutgoingQueue;
use crate::transport::MeshTransport;

/// This node's own state, broadcast in two parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnState {
    pub switch_state: u8,
    pub flags: u8,
    pub power_factor: i8,
    pub power_usage_real: i16,
    pub temperature: i8,
    pub energy_used: i32,
}

pub struct MeshSender {
    queue: OutgoingQueue,
    repeats: RepeatConfig,
    /// Partial timestamp used while the clock is unset.
    state_counter: u16,
}

impl MeshSender {
    pub fn new(queue: OutgoingQueue, repeats: RepeatConfig) -> Self {
        Self {
            queue,
            repeats,
            state_counter: 0,
        }
    }

    pub fn queue(&self) -> &OutgoingQueue {
        &self.queue
    }

    /// Queue an already built message under an explicit key.
    pub fn enqueue(
        &mut self,
        msg: &MeshMessage,
        target_id: u16,
        repeats: u8,
        priority: bool,
    ) -> Result<usize, EngineError> {
        let frame = msg.encode()?;
        self.queue
            .enqueue(frame.msg_type(), target_id, frame.payload(), repeats, priority)
    }

    pub fn cancel(&mut self, msg_type: MessageType, target_id: u16) -> bool {
        self.queue.cancel(msg_type, target_id)
    }

    pub fn drain_burst(
        &mut self,
        max_items: usize,
        transport: &mut dyn MeshTransport,
        clock: &dyn Clock,
    ) -> usize {
        self.queue.drain_burst(max_items, transport, clock)
    }

    // ── Time ──────────────────────────────────────────────────────────────────

    /// Tell every node to set its clock. A zero timestamp is rejected.
    pub fn send_set_time(&mut self, timestamp: u32) -> Result<usize, EngineError> {
        if timestamp == 0 {
            return Err(EngineError::WrongParameter("timestamp must be non-zero"));
        }
        let msg = MeshMessage::CmdTime(TimePayload {
            timestamp: Le32::new(timestamp),
        });
        self.enqueue(&msg, 0, self.repeats.medium, true)
    }

    /// Broadcast the current time. The value is refreshed when sent.
    pub fn send_time(&mut self, timestamp: u32) -> Result<usize, EngineError> {
        let msg = MeshMessage::StateTime(TimePayload {
            timestamp: Le32::new(timestamp),
        });
        self.enqueue(&msg, 0, self.repeats.low, true)
    }

    pub fn send_time_sync(
        &mut self,
        posix_s: u32,
        posix_ms: u16,
        version: u16,
        override_root: bool,
    ) -> Result<usize, EngineError> {
        let msg = MeshMessage::TimeSync(TimeSync {
            posix_s: Le32::new(posix_s),
            posix_ms: Le16::new(posix_ms),
            version: Le16::new(version),
            flags: if override_root {
                TIME_SYNC_FLAG_OVERRIDE_ROOT
            } else {
                0
            },
        });
        self.enqueue(&msg, 0, self.repeats.low, true)
    }

    // ── Liveness ──────────────────────────────────────────────────────────────

    pub fn send_noop(&mut self) -> Result<usize, EngineError> {
        self.enqueue(&MeshMessage::Noop, 0, self.repeats.low, false)
    }

    pub fn send_keep_alive(&mut self) -> Result<usize, EngineError> {
        self.enqueue(&MeshMessage::KeepAlive, 0, self.repeats.low, false)
    }

    pub fn send_keep_alive_state(&mut self, item: KeepAliveStateItem) -> Result<usize, EngineError> {
        let target = item.stone_id as u16;
        self.enqueue(
            &MeshMessage::KeepAliveState(item),
            target,
            self.repeats.medium,
            false,
        )
    }

    pub fn send_test(&mut self, counter: u32) -> Result<usize, EngineError> {
        let msg = MeshMessage::Test(TestPayload {
            counter: Le32::new(counter),
            dummy: [0; 3],
        });
        self.enqueue(&msg, 0, self.repeats.low, false)
    }

    // ── Switching ─────────────────────────────────────────────────────────────

    /// Queue a switch command for one node. Commands from a phone or UART
    /// use the high repeat count.
    pub fn send_multi_switch(&mut self, item: MultiSwitchItem) -> Result<usize, EngineError> {
        let user_facing = SourceKind::try_from(item.source_kind)
            .map(|kind| CmdSource::new(kind, item.source_id).is_user_facing())
            .unwrap_or(false);
        let repeats = if user_facing {
            self.repeats.high
        } else {
            self.repeats.medium
        };
        let target = item.stone_id as u16;
        self.enqueue(&MeshMessage::MultiSwitch(item), target, repeats, true)
    }

    pub fn send_behaviour_settings(&mut self, flags: u32) -> Result<usize, EngineError> {
        let msg = MeshMessage::BehaviourSettings(BehaviourSettings {
            flags: Le32::new(flags),
        });
        self.enqueue(&msg, 0, self.repeats.medium, false)
    }

    // ── Presence ──────────────────────────────────────────────────────────────

    /// Keyed by the combination so different profile/location pairs coexist.
    pub fn send_profile_location(&mut self, profile: u8, location: u8) -> Result<usize, EngineError> {
        let msg = MeshMessage::ProfileLocation(ProfileLocation { profile, location });
        let target = ((location as u16) << 8) | profile as u16;
        self.enqueue(&msg, target, self.repeats.low, false)
    }

    pub fn send_tracked_device_register(
        &mut self,
        register: TrackedDeviceRegister,
    ) -> Result<usize, EngineError> {
        let target = register.device_id.get();
        self.enqueue(
            &MeshMessage::TrackedDeviceRegister(register),
            target,
            self.repeats.medium,
            false,
        )
    }

    pub fn send_tracked_device_token(
        &mut self,
        token: TrackedDeviceToken,
    ) -> Result<usize, EngineError> {
        let target = token.device_id.get();
        self.enqueue(
            &MeshMessage::TrackedDeviceToken(token),
            target,
            self.repeats.medium,
            false,
        )
    }

    pub fn send_tracked_device_heartbeat(
        &mut self,
        heartbeat: TrackedDeviceHeartbeat,
    ) -> Result<usize, EngineError> {
        let target = heartbeat.device_id.get();
        self.enqueue(
            &MeshMessage::TrackedDeviceHeartbeat(heartbeat),
            target,
            self.repeats.low,
            false,
        )
    }

    pub fn send_tracked_device_list_size(&mut self, list_size: u8) -> Result<usize, EngineError> {
        let msg = MeshMessage::TrackedDeviceListSize(TrackedDeviceListSize { list_size });
        self.enqueue(&msg, 0, self.repeats.low, false)
    }

    // ── State and topology ────────────────────────────────────────────────────

    /// Queue both state parts under one partial timestamp: the low 16 bits of
    /// the clock, or a per-broadcast counter while the clock is unset.
    pub fn send_own_state(&mut self, state: OwnState, clock: &dyn Clock) -> Result<u16, EngineError> {
        let now = clock.now_posix();
        let partial_timestamp = if now != 0 {
            now as u16
        } else {
            self.state_counter = self.state_counter.wrapping_add(1);
            self.state_counter
        };

        let part0 = StatePart0 {
            switch_state: state.switch_state,
            flags: state.flags,
            power_factor: state.power_factor,
            power_usage_real: LeI16::new(state.power_usage_real),
            partial_timestamp: Le16::new(partial_timestamp),
        };
        let part1 = StatePart1 {
            temperature: state.temperature,
            energy_used: LeI32::new(state.energy_used),
            partial_timestamp: Le16::new(partial_timestamp),
        };
        // Both parts or neither.
        if !self
            .queue
            .has_room_for(&[(MessageType::State0, 0), (MessageType::State1, 0)])
        {
            tracing::warn!(partial_timestamp, "no room for own state broadcast");
            return Err(EngineError::QueueFull);
        }
        self.queue.enqueue(
            MessageType::State0,
            0,
            part0.as_bytes(),
            self.repeats.low,
            false,
        )?;
        self.queue.enqueue(
            MessageType::State1,
            0,
            part1.as_bytes(),
            self.repeats.low,
            false,
        )?;
        Ok(partial_timestamp)
    }

    pub fn send_neighbour_rssi(
        &mut self,
        stone_id: StoneId,
        rssi: i8,
        channel: u8,
    ) -> Result<usize, EngineError> {
        let msg = MeshMessage::NeighbourRssi(NeighbourRssi {
            stone_id,
            rssi,
            channel,
        });
        self.enqueue(&msg, stone_id as u16, self.repeats.low, false)
    }
}
