//! Local collaborators of the daemon: wall clock, a logging event bus and a
//! command executor that drives a simulated switch.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use stonemesh_core::access::{AccessLevel, CmdSource, CommandType};
use stonemesh_core::ReturnCode;
use stonemesh_services::{Clock, CommandExecutor, CommandOutcome, EventBus, Handled, MeshEvent};

/// System time, or 0 before the epoch.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_posix(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Logs every event. Never claims a message, so built-in handling always runs.
pub struct LoggingBus {
    pub switch: SwitchState,
}

impl EventBus for LoggingBus {
    fn dispatch(&mut self, event: &MeshEvent) -> Handled {
        match event {
            MeshEvent::MessageReceived {
                msg_type,
                payload,
                source_id,
                hops,
                ..
            } => tracing::trace!(
                ?msg_type,
                source_id,
                hops,
                payload = hex::encode(payload),
                "mesh message"
            ),
            MeshEvent::MultiSwitch {
                switch_cmd, delay, ..
            } => {
                tracing::info!(switch_cmd, delay, "multi-switch for this node");
                if *delay == 0 {
                    self.switch.apply(*switch_cmd);
                }
            }
            MeshEvent::ExternalStoneState(state) => tracing::info!(
                stone_id = state.stone_id,
                switch_state = state.switch_state,
                power_usage_real = state.power_usage_real,
                energy_used = state.energy_used,
                rssi = ?state.rssi,
                "external state"
            ),
            MeshEvent::ResultReceived { source_id, reply } => tracing::info!(
                source_id,
                original_type = reply.original_type,
                code = ?reply.return_code,
                payload = hex::encode(&reply.payload),
                "result"
            ),
            MeshEvent::ReliableOutcome {
                msg_type,
                target_id,
                status,
            } => tracing::info!(?msg_type, target_id, ?status, "reliable outcome"),
            other => tracing::debug!(event = ?other, "mesh event"),
        }
        Handled::Unhandled
    }
}

/// Switch level shared between the bus, the executor and the state broadcast.
#[derive(Debug, Clone, Default)]
pub struct SwitchState {
    level: Rc<Cell<u8>>,
}

impl SwitchState {
    pub fn level(&self) -> u8 {
        self.level.get()
    }

    /// 0 = off, 1..=100 = dim level, 255 = toggle.
    pub fn apply(&self, switch_cmd: u8) {
        let level = match switch_cmd {
            255 if self.level.get() == 0 => 100,
            255 => 0,
            cmd => cmd.min(100),
        };
        self.level.set(level);
        tracing::info!(level, "switch");
    }
}

/// Runs the switching commands on the simulated switch. Other mesh commands
/// are logged and reported as not implemented.
pub struct SwitchExecutor {
    pub switch: SwitchState,
}

impl CommandExecutor for SwitchExecutor {
    fn execute(
        &mut self,
        command: CommandType,
        payload: &[u8],
        access: AccessLevel,
        source: CmdSource,
    ) -> CommandOutcome {
        tracing::debug!(
            ?command,
            ?access,
            ?source,
            payload = hex::encode(payload),
            "execute"
        );
        match command {
            CommandType::Switch | CommandType::Pwm | CommandType::Relay => {
                let Some(&level) = payload.first() else {
                    return CommandOutcome::code(ReturnCode::WrongPayloadLength);
                };
                self.switch.apply(level);
                CommandOutcome {
                    code: ReturnCode::Success,
                    data: Bytes::copy_from_slice(&[self.switch.level()]),
                }
            }
            _ => CommandOutcome::code(ReturnCode::NotImplemented),
        }
    }
}
