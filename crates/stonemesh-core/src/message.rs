//! Mesh message codec.
//!
//! `Frame` is the raw envelope as it travels through the transport: a type
//! byte plus payload, held in a fixed buffer sized for the largest envelope.
//! `MeshMessage` is the typed view, one variant per `MessageType`.

use bytes::Bytes;
use zerocopy::AsBytes;

use crate::wire::{
    read_prefix, BehaviourSettings, ControlCommandHeader, KeepAliveStateItem, MessageType,
    MultiSwitchItem, NeighbourRssi, ProfileLocation, ResultHeader, StatePart0, StatePart1,
    StateRequestHeader, TestPayload, TimePayload, TimeSync, TrackedDeviceHeartbeat,
    TrackedDeviceListSize, TrackedDeviceRegister, TrackedDeviceToken, WireError,
    MAX_MESH_MSG_SIZE, MESH_HEADER_SIZE,
};

// ── Frame ─────────────────────────────────────────────────────────────────────

/// An encoded envelope: `[type][payload]`, at most `MAX_MESH_MSG_SIZE` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buf: [u8; MAX_MESH_MSG_SIZE],
    len: usize,
}

impl Frame {
    /// Build a frame, validating the payload against the type's shape.
    pub fn encode(msg_type: MessageType, payload: &[u8]) -> Result<Self, WireError> {
        msg_type.check_payload_len(payload.len())?;
        let mut buf = [0u8; MAX_MESH_MSG_SIZE];
        buf[0] = msg_type.into();
        buf[MESH_HEADER_SIZE..MESH_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        Ok(Self {
            buf,
            len: MESH_HEADER_SIZE + payload.len(),
        })
    }

    /// Copy a received envelope into a frame after validating it.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let (msg_type, payload) = decode_raw(bytes)?;
        Self::encode(msg_type, payload)
    }

    pub fn msg_type(&self) -> MessageType {
        // Only constructed through encode(), so the tag is always valid.
        MessageType::ALL[self.buf[0] as usize]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[MESH_HEADER_SIZE..self.len]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("msg_type", &self.msg_type())
            .field("payload", &HexBytes(self.payload()))
            .finish()
    }
}

struct HexBytes<'a>(&'a [u8]);

impl std::fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Split a received envelope into its type and payload, validating size.
pub fn decode_raw(bytes: &[u8]) -> Result<(MessageType, &[u8]), WireError> {
    if bytes.len() < MESH_HEADER_SIZE {
        return Err(WireError::TooShort(bytes.len()));
    }
    if bytes.len() > MAX_MESH_MSG_SIZE {
        return Err(WireError::PayloadTooLarge(bytes.len() - MESH_HEADER_SIZE));
    }
    let msg_type = MessageType::try_from(bytes[0])?;
    let payload = &bytes[MESH_HEADER_SIZE..];
    msg_type.check_payload_len(payload.len())?;
    Ok((msg_type, payload))
}

// ── Typed messages ────────────────────────────────────────────────────────────

/// A decoded mesh message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    Test(TestPayload),
    Ack,
    StateTime(TimePayload),
    CmdTime(TimePayload),
    Noop,
    MultiSwitch(MultiSwitchItem),
    KeepAliveState(KeepAliveStateItem),
    KeepAlive,
    State0(StatePart0),
    State1(StatePart1),
    ProfileLocation(ProfileLocation),
    BehaviourSettings(BehaviourSettings),
    TrackedDeviceRegister(TrackedDeviceRegister),
    TrackedDeviceToken(TrackedDeviceToken),
    TrackedDeviceListSize(TrackedDeviceListSize),
    TrackedDeviceHeartbeat(TrackedDeviceHeartbeat),
    TimeSync(TimeSync),
    StateSet {
        header: StateRequestHeader,
        value: Bytes,
    },
    StateGet(StateRequestHeader),
    Result {
        header: ResultHeader,
        payload: Bytes,
    },
    ControlCommand {
        header: ControlCommandHeader,
        payload: Bytes,
    },
    NeighbourRssi(NeighbourRssi),
}

impl MeshMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            MeshMessage::Test(_) => MessageType::Test,
            MeshMessage::Ack => MessageType::Ack,
            MeshMessage::StateTime(_) => MessageType::StateTime,
            MeshMessage::CmdTime(_) => MessageType::CmdTime,
            MeshMessage::Noop => MessageType::Noop,
            MeshMessage::MultiSwitch(_) => MessageType::MultiSwitch,
            MeshMessage::KeepAliveState(_) => MessageType::KeepAliveState,
            MeshMessage::KeepAlive => MessageType::KeepAlive,
            MeshMessage::State0(_) => MessageType::State0,
            MeshMessage::State1(_) => MessageType::State1,
            MeshMessage::ProfileLocation(_) => MessageType::ProfileLocation,
            MeshMessage::BehaviourSettings(_) => MessageType::BehaviourSettings,
            MeshMessage::TrackedDeviceRegister(_) => MessageType::TrackedDeviceRegister,
            MeshMessage::TrackedDeviceToken(_) => MessageType::TrackedDeviceToken,
            MeshMessage::TrackedDeviceListSize(_) => MessageType::TrackedDeviceListSize,
            MeshMessage::TrackedDeviceHeartbeat(_) => MessageType::TrackedDeviceHeartbeat,
            MeshMessage::TimeSync(_) => MessageType::TimeSync,
            MeshMessage::StateSet { .. } => MessageType::StateSet,
            MeshMessage::StateGet(_) => MessageType::StateGet,
            MeshMessage::Result { .. } => MessageType::Result,
            MeshMessage::ControlCommand { .. } => MessageType::ControlCommand,
            MeshMessage::NeighbourRssi(_) => MessageType::NeighbourRssi,
        }
    }

    /// Encode into a frame. Fails if a variable tail overflows the frame.
    pub fn encode(&self) -> Result<Frame, WireError> {
        let mut payload = [0u8; MAX_MESH_MSG_SIZE];
        let len = self.write_payload(&mut payload)?;
        Frame::encode(self.msg_type(), &payload[..len])
    }

    fn write_payload(&self, out: &mut [u8]) -> Result<usize, WireError> {
        fn put(out: &mut [u8], parts: &[&[u8]]) -> Result<usize, WireError> {
            let total: usize = parts.iter().map(|p| p.len()).sum();
            if total > out.len() {
                return Err(WireError::PayloadTooLarge(total));
            }
            let mut at = 0;
            for part in parts {
                out[at..at + part.len()].copy_from_slice(part);
                at += part.len();
            }
            Ok(total)
        }

        match self {
            MeshMessage::Ack | MeshMessage::Noop | MeshMessage::KeepAlive => Ok(0),
            MeshMessage::Test(p) => put(out, &[p.as_bytes()]),
            MeshMessage::StateTime(p) | MeshMessage::CmdTime(p) => put(out, &[p.as_bytes()]),
            MeshMessage::MultiSwitch(p) => put(out, &[p.as_bytes()]),
            MeshMessage::KeepAliveState(p) => put(out, &[p.as_bytes()]),
            MeshMessage::State0(p) => put(out, &[p.as_bytes()]),
            MeshMessage::State1(p) => put(out, &[p.as_bytes()]),
            MeshMessage::ProfileLocation(p) => put(out, &[p.as_bytes()]),
            MeshMessage::BehaviourSettings(p) => put(out, &[p.as_bytes()]),
            MeshMessage::TrackedDeviceRegister(p) => put(out, &[p.as_bytes()]),
            MeshMessage::TrackedDeviceToken(p) => put(out, &[p.as_bytes()]),
            MeshMessage::TrackedDeviceListSize(p) => put(out, &[p.as_bytes()]),
            MeshMessage::TrackedDeviceHeartbeat(p) => put(out, &[p.as_bytes()]),
            MeshMessage::TimeSync(p) => put(out, &[p.as_bytes()]),
            MeshMessage::StateSet { header, value } => put(out, &[header.as_bytes(), &value[..]]),
            MeshMessage::StateGet(header) => put(out, &[header.as_bytes()]),
            MeshMessage::Result { header, payload } => put(out, &[header.as_bytes(), &payload[..]]),
            MeshMessage::ControlCommand { header, payload } => {
                put(out, &[header.as_bytes(), &payload[..]])
            }
            MeshMessage::NeighbourRssi(p) => put(out, &[p.as_bytes()]),
        }
    }

    /// Decode and validate a received envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (msg_type, payload) = decode_raw(bytes)?;
        Self::from_payload(msg_type, payload)
    }

    /// Build the typed view of an already split envelope.
    pub fn from_payload(msg_type: MessageType, payload: &[u8]) -> Result<Self, WireError> {
        msg_type.check_payload_len(payload.len())?;
        let t = msg_type;
        let msg = match msg_type {
            MessageType::Test => MeshMessage::Test(read_prefix(t, payload)?),
            MessageType::Ack => MeshMessage::Ack,
            MessageType::StateTime => MeshMessage::StateTime(read_prefix(t, payload)?),
            MessageType::CmdTime => MeshMessage::CmdTime(read_prefix(t, payload)?),
            MessageType::Noop => MeshMessage::Noop,
            MessageType::MultiSwitch => MeshMessage::MultiSwitch(read_prefix(t, payload)?),
            MessageType::KeepAliveState => MeshMessage::KeepAliveState(read_prefix(t, payload)?),
            MessageType::KeepAlive => MeshMessage::KeepAlive,
            MessageType::State0 => MeshMessage::State0(read_prefix(t, payload)?),
            MessageType::State1 => MeshMessage::State1(read_prefix(t, payload)?),
            MessageType::ProfileLocation => MeshMessage::ProfileLocation(read_prefix(t, payload)?),
            MessageType::BehaviourSettings => {
                MeshMessage::BehaviourSettings(read_prefix(t, payload)?)
            }
            MessageType::TrackedDeviceRegister => {
                MeshMessage::TrackedDeviceRegister(read_prefix(t, payload)?)
            }
            MessageType::TrackedDeviceToken => {
                MeshMessage::TrackedDeviceToken(read_prefix(t, payload)?)
            }
            MessageType::TrackedDeviceListSize => {
                MeshMessage::TrackedDeviceListSize(read_prefix(t, payload)?)
            }
            MessageType::TrackedDeviceHeartbeat => {
                MeshMessage::TrackedDeviceHeartbeat(read_prefix(t, payload)?)
            }
            MessageType::TimeSync => MeshMessage::TimeSync(read_prefix(t, payload)?),
            MessageType::StateSet => {
                let header: StateRequestHeader = read_prefix(t, payload)?;
                let value = tail::<StateRequestHeader>(payload);
                MeshMessage::StateSet { header, value }
            }
            MessageType::StateGet => MeshMessage::StateGet(read_prefix(t, payload)?),
            MessageType::Result => {
                let header: ResultHeader = read_prefix(t, payload)?;
                let payload = tail::<ResultHeader>(payload);
                MeshMessage::Result { header, payload }
            }
            MessageType::ControlCommand => {
                let header: ControlCommandHeader = read_prefix(t, payload)?;
                let payload = tail::<ControlCommandHeader>(payload);
                MeshMessage::ControlCommand { header, payload }
            }
            MessageType::NeighbourRssi => MeshMessage::NeighbourRssi(read_prefix(t, payload)?),
        };
        Ok(msg)
    }
}

fn tail<H>(payload: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&payload[core::mem::size_of::<H>()..])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Le16, Le32, LeI32, MAX_MESH_PAYLOAD};

    fn sample(t: MessageType) -> MeshMessage {
        match t {
            MessageType::Test => MeshMessage::Test(TestPayload {
                counter: Le32::new(41),
                dummy: [0xAA; 3],
            }),
            MessageType::Ack => MeshMessage::Ack,
            MessageType::StateTime => MeshMessage::StateTime(TimePayload {
                timestamp: Le32::new(1_700_000_000),
            }),
            MessageType::CmdTime => MeshMessage::CmdTime(TimePayload {
                timestamp: Le32::new(1_700_000_001),
            }),
            MessageType::Noop => MeshMessage::Noop,
            MessageType::MultiSwitch => MeshMessage::MultiSwitch(MultiSwitchItem {
                stone_id: 4,
                switch_cmd: 100,
                delay: Le16::new(10),
                source_kind: 0,
                source_id: 2,
            }),
            MessageType::KeepAliveState => MeshMessage::KeepAliveState(KeepAliveStateItem {
                stone_id: 4,
                action: 1,
                timeout: Le16::new(300),
            }),
            MessageType::KeepAlive => MeshMessage::KeepAlive,
            MessageType::State0 => MeshMessage::State0(StatePart0 {
                switch_state: 100,
                flags: 0x03,
                power_factor: 100,
                power_usage_real: crate::wire::LeI16::new(960),
                partial_timestamp: Le16::new(7),
            }),
            MessageType::State1 => MeshMessage::State1(StatePart1 {
                temperature: 31,
                energy_used: LeI32::new(123_456),
                partial_timestamp: Le16::new(7),
            }),
            MessageType::ProfileLocation => MeshMessage::ProfileLocation(ProfileLocation {
                profile: 1,
                location: 9,
            }),
            MessageType::BehaviourSettings => MeshMessage::BehaviourSettings(BehaviourSettings {
                flags: Le32::new(1),
            }),
            MessageType::TrackedDeviceRegister => {
                MeshMessage::TrackedDeviceRegister(TrackedDeviceRegister {
                    device_id: Le16::new(513),
                    location_id: 3,
                    profile_id: 0,
                    rssi_offset: -4,
                    flags: 0,
                    access_level: 1,
                })
            }
            MessageType::TrackedDeviceToken => MeshMessage::TrackedDeviceToken(TrackedDeviceToken {
                device_id: Le16::new(513),
                device_token: [1, 2, 3],
                ttl_minutes: Le16::new(60),
            }),
            MessageType::TrackedDeviceListSize => {
                MeshMessage::TrackedDeviceListSize(TrackedDeviceListSize { list_size: 12 })
            }
            MessageType::TrackedDeviceHeartbeat => {
                MeshMessage::TrackedDeviceHeartbeat(TrackedDeviceHeartbeat {
                    device_id: Le16::new(513),
                    location_id: 3,
                    ttl_minutes: 5,
                })
            }
            MessageType::TimeSync => MeshMessage::TimeSync(TimeSync {
                posix_s: Le32::new(1_700_000_000),
                posix_ms: Le16::new(250),
                version: Le16::new(3),
                flags: 1,
            }),
            MessageType::StateSet => MeshMessage::StateSet {
                header: state_header(),
                value: Bytes::from_static(&[1, 2, 3, 4]),
            },
            MessageType::StateGet => MeshMessage::StateGet(state_header()),
            MessageType::Result => MeshMessage::Result {
                header: ResultHeader {
                    msg_type: MessageType::StateSet.into(),
                    return_code: 0,
                },
                payload: Bytes::from_static(&[9, 9]),
            },
            MessageType::ControlCommand => MeshMessage::ControlCommand {
                header: ControlCommandHeader {
                    target_id: 0,
                    command_type: Le16::new(20),
                    access_level: 0,
                    source: 0x22,
                },
                payload: Bytes::from_static(&[100]),
            },
            MessageType::NeighbourRssi => MeshMessage::NeighbourRssi(NeighbourRssi {
                stone_id: 8,
                rssi: -61,
                channel: 37,
            }),
        }
    }

    fn state_header() -> StateRequestHeader {
        StateRequestHeader {
            target_id: 3,
            state_type: 40,
            state_id: 0,
            persistence: 0,
            access_level: 0,
            source: 0x22,
        }
    }

    #[test]
    fn every_type_survives_encode_decode() {
        for t in MessageType::ALL {
            let msg = sample(t);
            assert_eq!(msg.msg_type(), t);
            let frame = msg.encode().unwrap();
            assert_eq!(frame.msg_type(), t);
            assert_eq!(MeshMessage::decode(frame.as_bytes()).unwrap(), msg, "{t:?}");
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(MeshMessage::decode(&[]), Err(WireError::TooShort(0)));
        assert_eq!(decode_raw(&[]).unwrap_err(), WireError::TooShort(0));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            MeshMessage::decode(&[0xFF]),
            Err(WireError::UnknownType(0xFF))
        );
    }

    #[test]
    fn truncated_fixed_payload_is_rejected() {
        let frame = sample(MessageType::State1).encode().unwrap();
        let short = &frame.as_bytes()[..frame.len() - 1];
        assert!(matches!(
            MeshMessage::decode(short),
            Err(WireError::WrongPayloadSize { expected: 7, actual: 6, .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let bytes = [MessageType::StateSet as u8; MAX_MESH_MSG_SIZE + 1];
        assert!(matches!(
            MeshMessage::decode(&bytes),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn tail_overflow_fails_encode() {
        let msg = MeshMessage::StateSet {
            header: state_header(),
            value: Bytes::from(vec![0u8; MAX_MESH_PAYLOAD]),
        };
        assert!(matches!(msg.encode(), Err(WireError::PayloadTooLarge(_))));
    }

    #[test]
    fn raw_frame_layout() {
        let frame = Frame::encode(MessageType::CmdTime, &[1, 0, 0, 0]).unwrap();
        assert_eq!(frame.as_bytes(), &[3, 1, 0, 0, 0]);
        assert_eq!(frame.payload(), &[1, 0, 0, 0]);
        assert!(Frame::encode(MessageType::CmdTime, &[1, 0, 0]).is_err());
        assert_eq!(Frame::parse(frame.as_bytes()).unwrap(), frame);
    }
}
