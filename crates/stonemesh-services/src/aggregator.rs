//! Merges the two halves of a remote node's state broadcast.
//!
//! A node broadcasts its state as `State0` and `State1`, both stamped with
//! the same 16-bit partial timestamp. The aggregator holds a single slot keyed
//! by `(source, partial_timestamp)`: a part with another key restarts the
//! merge, so interleaved broadcasts from two nodes can starve each other.

use stonemesh_core::wire::{StatePart0, StatePart1, StoneId, SERVICE_DATA_VALIDATION};

const PART_0: u8 = 1 << 0;
const PART_1: u8 = 1 << 1;
const ALL_PARTS: u8 = PART_0 | PART_1;

/// Merged state of a remote node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalState {
    pub stone_id: StoneId,
    pub switch_state: u8,
    pub flags: u8,
    pub temperature: i8,
    pub power_factor: i8,
    pub power_usage_real: i16,
    pub energy_used: i32,
    pub partial_timestamp: u16,
    /// Signal strength of the part that completed the merge. `None` when
    /// that part was relayed or the link could not measure it.
    pub rssi: Option<i8>,
    /// `SERVICE_DATA_VALIDATION` once both parts merged.
    pub validation: u16,
}

#[derive(Debug, Default)]
pub struct StateAggregator {
    current: ExternalState,
    received: u8,
}

impl StateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge part 0. Returns the full state if this completed it.
    pub fn receive_part0(
        &mut self,
        source_id: StoneId,
        hops: u8,
        rssi: Option<i8>,
        part: &StatePart0,
    ) -> Option<ExternalState> {
        self.adopt(source_id, part.partial_timestamp.get());
        self.current.switch_state = part.switch_state;
        self.current.flags = part.flags;
        self.current.power_factor = part.power_factor;
        self.current.power_usage_real = part.power_usage_real.get();
        self.merged(PART_0, hops, rssi)
    }

    /// Merge part 1. Returns the full state if this completed it.
    pub fn receive_part1(
        &mut self,
        source_id: StoneId,
        hops: u8,
        rssi: Option<i8>,
        part: &StatePart1,
    ) -> Option<ExternalState> {
        self.adopt(source_id, part.partial_timestamp.get());
        self.current.temperature = part.temperature;
        self.current.energy_used = part.energy_used.get();
        self.merged(PART_1, hops, rssi)
    }

    fn adopt(&mut self, source_id: StoneId, partial_timestamp: u16) {
        if self.current.stone_id == source_id
            && self.current.partial_timestamp == partial_timestamp
        {
            return;
        }
        if self.received != 0 {
            tracing::trace!(
                dropped_source = self.current.stone_id,
                dropped_timestamp = self.current.partial_timestamp,
                source_id,
                partial_timestamp,
                "state merge restarted"
            );
        }
        self.received = 0;
        self.current = ExternalState {
            stone_id: source_id,
            partial_timestamp,
            ..ExternalState::default()
        };
    }

    fn merged(&mut self, part: u8, hops: u8, rssi: Option<i8>) -> Option<ExternalState> {
        self.current.rssi = if hops == 0 { rssi } else { None };
        self.received |= part;
        if self.received != ALL_PARTS {
            return None;
        }
        self.received = 0;
        let mut state = self.current;
        state.validation = SERVICE_DATA_VALIDATION;
        Some(state)
    }
}
