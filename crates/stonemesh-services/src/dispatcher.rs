//! Incoming dispatcher — validates received envelopes and routes them.
//!
//! Every envelope goes through two stages. The local bus sees it first as
//! `MessageReceived` and may claim it. Unclaimed envelopes fall through to
//! the built-in handler for their type, whose return code becomes a generic
//! `Result` reply when the sender asked for one. State and control requests
//! build their own reply in the relay.

use bytes::Bytes;

use stonemesh_core::access::{AccessLevel, CmdSource, SourceKind};
use stonemesh_core::wire::{
    KeepAliveStateItem, MessageType, MultiSwitchItem, StoneId, TIME_SYNC_FLAG_OVERRIDE_ROOT,
    TYPE_UNKNOWN,
};
use stonemesh_core::{MeshMessage, ReplyEnvelope, ReturnCode, WireError};

use crate::aggregator::{ExternalState, StateAggregator};
use crate::event::{Handled, MeshEvent};
use crate::local::LocalServices;
use crate::relay::CommandRelay;
use crate::transport::Inbound;

/// Counters for `Test` messages. The first counter heard is the baseline;
/// gaps after it are counted as dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestStats {
    pub received: u32,
    pub dropped: u32,
    pub last_counter: Option<u32>,
}

impl TestStats {
    fn record(&mut self, counter: u32) {
        let Some(last) = self.last_counter else {
            self.last_counter = Some(counter);
            return;
        };
        if counter == last {
            return;
        }
        self.last_counter = Some(counter);
        let expected = last.wrapping_add(1);
        if counter < expected {
            tracing::warn!(counter, expected, "test counter went back");
            return;
        }
        self.dropped = self.dropped.saturating_add(counter - expected);
        self.received = self.received.saturating_add(1);
    }
}

pub struct IncomingDispatcher {
    own_id: StoneId,
    last_state_time: Option<u32>,
    last_cmd_time: Option<u32>,
    last_multi_switch: Option<MultiSwitchItem>,
    last_keep_alive_state: Option<KeepAliveStateItem>,
    test_stats: TestStats,
    aggregator: StateAggregator,
}

impl IncomingDispatcher {
    pub fn new(own_id: StoneId) -> Self {
        Self {
            own_id,
            last_state_time: None,
            last_cmd_time: None,
            last_multi_switch: None,
            last_keep_alive_state: None,
            test_stats: TestStats::default(),
            aggregator: StateAggregator::new(),
        }
    }

    pub fn test_stats(&self) -> &TestStats {
        &self.test_stats
    }

    /// Handle one received envelope to completion. Returns the reply to send
    /// back to the source, if the source asked for one.
    pub fn handle(
        &mut self,
        inbound: &Inbound<'_>,
        relay: &CommandRelay,
        services: &mut LocalServices,
    ) -> Option<ReplyEnvelope> {
        if inbound.source_id == self.own_id {
            tracing::trace!(source_id = inbound.source_id, "own envelope looped back");
            return None;
        }

        let msg = match MeshMessage::decode(inbound.data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    source_id = inbound.source_id,
                    frame = hex::encode(inbound.data),
                    "invalid envelope"
                );
                let original_type = match e {
                    WireError::TooShort(_) => TYPE_UNKNOWN,
                    _ => inbound.data[0],
                };
                return reply_if_requested(
                    inbound,
                    ReplyEnvelope::new(original_type, ReturnCode::InvalidMessage),
                );
            }
        };
        let msg_type = msg.msg_type();

        let received = MeshEvent::MessageReceived {
            msg_type,
            payload: Bytes::copy_from_slice(&inbound.data[1..]),
            source_id: inbound.source_id,
            hops: inbound.hops,
            rssi: inbound.rssi,
            reply_requested: inbound.reply_requested,
        };
        if let Handled::Claimed { reply } = services.bus.dispatch(&received) {
            tracing::trace!(?msg_type, source_id = inbound.source_id, "claimed by local bus");
            return reply.and_then(|r| reply_if_requested(inbound, r));
        }

        let code = match &msg {
            MeshMessage::StateSet { .. }
            | MeshMessage::StateGet(_)
            | MeshMessage::ControlCommand { .. } => {
                return relay
                    .handle(&msg, services)
                    .and_then(|r| reply_if_requested(inbound, r));
            }
            // Never answer a reply.
            MeshMessage::Result { .. } => {
                self.on_result(&msg, inbound.source_id, services);
                return None;
            }
            MeshMessage::Test(p) => {
                self.test_stats.record(p.counter.get());
                ReturnCode::Success
            }
            MeshMessage::Ack => {
                tracing::debug!(source_id = inbound.source_id, "no handler for ack");
                ReturnCode::InvalidMessage
            }
            MeshMessage::Noop => ReturnCode::Success,
            MeshMessage::StateTime(p) => {
                let timestamp = p.timestamp.get();
                if self.last_state_time == Some(timestamp) {
                    ReturnCode::SuccessNoChange
                } else {
                    self.last_state_time = Some(timestamp);
                    publish(
                        services,
                        MeshEvent::MeshTime {
                            source_id: inbound.source_id,
                            timestamp,
                        },
                    )
                }
            }
            MeshMessage::CmdTime(p) => {
                let timestamp = p.timestamp.get();
                if timestamp == 0 {
                    ReturnCode::WrongParameter
                } else if self.last_cmd_time == Some(timestamp) {
                    ReturnCode::SuccessNoChange
                } else {
                    self.last_cmd_time = Some(timestamp);
                    publish(services, MeshEvent::SetTime { timestamp })
                }
            }
            MeshMessage::MultiSwitch(item) => self.on_multi_switch(item, services),
            MeshMessage::KeepAliveState(item) => self.on_keep_alive_state(item, services),
            MeshMessage::KeepAlive => publish(
                services,
                MeshEvent::KeepAlive {
                    source_id: inbound.source_id,
                },
            ),
            MeshMessage::State0(part) => {
                let merged =
                    self.aggregator
                        .receive_part0(inbound.source_id, inbound.hops, inbound.rssi, part);
                self.on_state_part(merged, services)
            }
            MeshMessage::State1(part) => {
                let merged =
                    self.aggregator
                        .receive_part1(inbound.source_id, inbound.hops, inbound.rssi, part);
                self.on_state_part(merged, services)
            }
            MeshMessage::ProfileLocation(p) => publish(
                services,
                MeshEvent::ProfileLocation {
                    source_id: inbound.source_id,
                    profile: p.profile,
                    location: p.location,
                },
            ),
            MeshMessage::BehaviourSettings(p) => publish(
                services,
                MeshEvent::BehaviourSettings {
                    flags: p.flags.get(),
                },
            ),
            MeshMessage::TrackedDeviceRegister(p) => publish(
                services,
                MeshEvent::TrackedDeviceRegister {
                    device_id: p.device_id.get(),
                    location_id: p.location_id,
                    profile_id: p.profile_id,
                    rssi_offset: p.rssi_offset,
                    flags: p.flags,
                    access_level: AccessLevel::inflate(p.access_level),
                },
            ),
            MeshMessage::TrackedDeviceToken(p) => publish(
                services,
                MeshEvent::TrackedDeviceToken {
                    device_id: p.device_id.get(),
                    device_token: p.device_token,
                    ttl_minutes: p.ttl_minutes.get(),
                },
            ),
            MeshMessage::TrackedDeviceListSize(p) => publish(
                services,
                MeshEvent::TrackedDeviceListSize {
                    source_id: inbound.source_id,
                    list_size: p.list_size,
                },
            ),
            MeshMessage::TrackedDeviceHeartbeat(p) => publish(
                services,
                MeshEvent::TrackedDeviceHeartbeat {
                    device_id: p.device_id.get(),
                    location_id: p.location_id,
                    ttl_minutes: p.ttl_minutes,
                },
            ),
            MeshMessage::TimeSync(p) => publish(
                services,
                MeshEvent::TimeSync {
                    source_id: inbound.source_id,
                    posix_s: p.posix_s.get(),
                    posix_ms: p.posix_ms.get(),
                    version: p.version.get(),
                    override_root: p.flags & TIME_SYNC_FLAG_OVERRIDE_ROOT != 0,
                },
            ),
            MeshMessage::NeighbourRssi(p) => publish(
                services,
                MeshEvent::NeighbourRssi {
                    reporter_id: inbound.source_id,
                    neighbour_id: p.stone_id,
                    rssi: p.rssi,
                    channel: p.channel,
                },
            ),
        };

        tracing::trace!(?msg_type, source_id = inbound.source_id, ?code, "handled");
        reply_if_requested(inbound, ReplyEnvelope::new(msg_type, code))
    }

    fn on_multi_switch(&mut self, item: &MultiSwitchItem, services: &mut LocalServices) -> ReturnCode {
        if item.stone_id != self.own_id {
            return ReturnCode::Success;
        }
        if self.last_multi_switch.as_ref() == Some(item) {
            return ReturnCode::SuccessNoChange;
        }
        let kind = match SourceKind::try_from(item.source_kind) {
            Ok(kind) => kind,
            Err(_) => return ReturnCode::InvalidMessage,
        };
        self.last_multi_switch = Some(*item);
        let source = CmdSource {
            kind,
            id: item.source_id,
            external: true,
        };
        publish(
            services,
            MeshEvent::MultiSwitch {
                switch_cmd: item.switch_cmd,
                delay: item.delay.get(),
                source,
            },
        )
    }

    fn on_keep_alive_state(
        &mut self,
        item: &KeepAliveStateItem,
        services: &mut LocalServices,
    ) -> ReturnCode {
        if item.stone_id != self.own_id {
            return ReturnCode::Success;
        }
        if self.last_keep_alive_state.as_ref() == Some(item) {
            return ReturnCode::SuccessNoChange;
        }
        self.last_keep_alive_state = Some(*item);
        publish(
            services,
            MeshEvent::KeepAliveState {
                action: item.action,
                timeout: item.timeout.get(),
            },
        )
    }

    fn on_state_part(
        &mut self,
        merged: Option<ExternalState>,
        services: &mut LocalServices,
    ) -> ReturnCode {
        if let Some(state) = merged {
            tracing::debug!(
                stone_id = state.stone_id,
                partial_timestamp = state.partial_timestamp,
                "external state merged"
            );
            publish(services, MeshEvent::ExternalStoneState(state));
        }
        ReturnCode::Success
    }

    fn on_result(&mut self, msg: &MeshMessage, source_id: StoneId, services: &mut LocalServices) {
        match ReplyEnvelope::from_message(msg) {
            Some(Ok(reply)) => {
                tracing::debug!(
                    source_id,
                    original_type = reply.original_type,
                    code = ?reply.return_code,
                    "result received"
                );
                publish(services, MeshEvent::ResultReceived { source_id, reply });
            }
            Some(Err(e)) => tracing::debug!(error = %e, source_id, "unreadable result"),
            None => {}
        }
    }
}

fn publish(services: &mut LocalServices, event: MeshEvent) -> ReturnCode {
    services.bus.dispatch(&event);
    ReturnCode::Success
}

fn reply_if_requested(inbound: &Inbound<'_>, reply: ReplyEnvelope) -> Option<ReplyEnvelope> {
    inbound.reply_requested.then_some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHost;
    use stonemesh_core::access::{SOURCE_ID_CONNECTION, SOURCE_ID_SWITCHCRAFT};
    use stonemesh_core::wire::{
        ControlCommandHeader, Le16, Le32, LeI16, LeI32, StatePart0, StatePart1, TestPayload,
        TimePayload,
    };
    use stonemesh_core::CommandType;
    use stonemesh_core::Frame;

    const OWN: StoneId = 3;

    struct Harness {
        dispatcher: IncomingDispatcher,
        relay: CommandRelay,
        services: LocalServices,
        host: MockHost,
    }

    impl Harness {
        fn new() -> Self {
            let (services, host) = MockHost::new();
            Self {
                dispatcher: IncomingDispatcher::new(OWN),
                relay: CommandRelay::new(OWN, 3),
                services,
                host,
            }
        }

        fn receive_raw(
            &mut self,
            data: &[u8],
            source_id: StoneId,
            reply_requested: bool,
        ) -> Option<ReplyEnvelope> {
            let inbound = Inbound {
                data,
                source_id,
                hops: 0,
                rssi: Some(-60),
                reply_requested,
            };
            self.dispatcher.handle(&inbound, &self.relay, &mut self.services)
        }

        fn receive(&mut self, msg: &MeshMessage, source_id: StoneId) -> Option<ReplyEnvelope> {
            let frame = msg.encode().unwrap();
            self.receive_raw(frame.as_bytes(), source_id, true)
        }
    }

    fn switch_item(stone_id: StoneId, switch_cmd: u8) -> MeshMessage {
        MeshMessage::MultiSwitch(MultiSwitchItem {
            stone_id,
            switch_cmd,
            delay: Le16::new(0),
            source_kind: SourceKind::Enum as u8,
            source_id: SOURCE_ID_CONNECTION,
        })
    }

    #[test]
    fn empty_envelope_gets_unknown_type_reply() {
        let mut h = Harness::new();
        let reply = h.receive_raw(&[], 5, true).unwrap();
        assert_eq!(reply.original_type, TYPE_UNKNOWN);
        assert_eq!(reply.return_code, ReturnCode::InvalidMessage);
        assert!(h.receive_raw(&[], 5, false).is_none());
        assert!(h.host.bus.borrow().events.is_empty());
    }

    #[test]
    fn wrong_size_is_invalid_message() {
        let mut h = Harness::new();
        let reply = h
            .receive_raw(&[u8::from(MessageType::StateTime), 1, 2], 5, true)
            .unwrap();
        assert_eq!(reply.original_type, u8::from(MessageType::StateTime));
        assert_eq!(reply.return_code, ReturnCode::InvalidMessage);
        assert!(h.host.bus.borrow().events.is_empty());
    }

    #[test]
    fn claimed_message_skips_builtin_handler() {
        let mut h = Harness::new();
        let custom = ReplyEnvelope::new(MessageType::MultiSwitch, ReturnCode::Busy);
        h.host.bus.borrow_mut().claim = Some((MessageType::MultiSwitch, Some(custom.clone())));

        let reply = h.receive(&switch_item(OWN, 100), 5).unwrap();
        assert_eq!(reply, custom);
        let bus = h.host.bus.borrow();
        assert_eq!(bus.received_types(), vec![MessageType::MultiSwitch]);
        assert!(bus.effects().is_empty());
    }

    #[test]
    fn claim_without_reply_answers_nothing() {
        let mut h = Harness::new();
        h.host.bus.borrow_mut().claim = Some((MessageType::MultiSwitch, None));

        assert!(h.receive(&switch_item(OWN, 100), 5).is_none());
        assert!(h.host.bus.borrow().effects().is_empty());

        // The built-in handler never saw it, so nothing was recorded for
        // deduplication either.
        h.host.bus.borrow_mut().claim = None;
        assert_eq!(
            h.receive(&switch_item(OWN, 100), 5).unwrap().return_code,
            ReturnCode::Success
        );
    }

    #[test]
    fn multi_switch_for_self_is_deduplicated() {
        let mut h = Harness::new();
        assert_eq!(h.receive(&switch_item(OWN, 100), 5).unwrap().return_code, ReturnCode::Success);
        assert_eq!(
            h.receive(&switch_item(OWN, 100), 6).unwrap().return_code,
            ReturnCode::SuccessNoChange
        );
        h.receive(&switch_item(OWN, 0), 5);
        // Other nodes' switch items are not ours to apply.
        h.receive(&switch_item(9, 100), 5);

        let bus = h.host.bus.borrow();
        let effects = bus.effects();
        assert_eq!(effects.len(), 2);
        match effects[0] {
            MeshEvent::MultiSwitch { switch_cmd, source, .. } => {
                assert_eq!(*switch_cmd, 100);
                assert!(source.external);
                assert_eq!(source.id, SOURCE_ID_CONNECTION);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn time_broadcast_repeats_are_ignored() {
        let mut h = Harness::new();
        let msg = MeshMessage::StateTime(TimePayload {
            timestamp: Le32::new(1_700_000_000),
        });
        assert_eq!(h.receive(&msg, 5).unwrap().return_code, ReturnCode::Success);
        assert_eq!(h.receive(&msg, 6).unwrap().return_code, ReturnCode::SuccessNoChange);
        assert_eq!(
            h.host.bus.borrow().effects(),
            vec![&MeshEvent::MeshTime {
                source_id: 5,
                timestamp: 1_700_000_000
            }]
        );
    }

    #[test]
    fn zero_set_time_is_rejected() {
        let mut h = Harness::new();
        let msg = MeshMessage::CmdTime(TimePayload {
            timestamp: Le32::new(0),
        });
        assert_eq!(h.receive(&msg, 5).unwrap().return_code, ReturnCode::WrongParameter);
        assert!(h.host.bus.borrow().effects().is_empty());
    }

    #[test]
    fn state_parts_publish_one_external_state() {
        let mut h = Harness::new();
        let part0 = MeshMessage::State0(StatePart0 {
            switch_state: 100,
            flags: 0,
            power_factor: 100,
            power_usage_real: LeI16::new(40),
            partial_timestamp: Le16::new(77),
        });
        let part1 = MeshMessage::State1(StatePart1 {
            temperature: 30,
            energy_used: LeI32::new(12),
            partial_timestamp: Le16::new(77),
        });
        h.receive(&part0, 5);
        h.receive(&part1, 5);
        h.receive(&part1, 5);

        let bus = h.host.bus.borrow();
        let merged: Vec<_> = bus
            .effects()
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::ExternalStoneState(_)))
            .collect();
        assert_eq!(merged.len(), 1);
        if let MeshEvent::ExternalStoneState(state) = merged[0] {
            assert_eq!(state.stone_id, 5);
            assert_eq!(state.energy_used, 12);
            assert_eq!(state.rssi, Some(-60));
        }
    }

    #[test]
    fn unmeasured_link_leaves_rssi_unset() {
        let mut h = Harness::new();
        let part0 = MeshMessage::State0(StatePart0 {
            switch_state: 0,
            flags: 0,
            power_factor: 100,
            power_usage_real: LeI16::new(0),
            partial_timestamp: Le16::new(9),
        });
        let part1 = MeshMessage::State1(StatePart1 {
            temperature: 20,
            energy_used: LeI32::new(1),
            partial_timestamp: Le16::new(9),
        });
        for msg in [part0, part1] {
            let frame = msg.encode().unwrap();
            let inbound = Inbound {
                data: frame.as_bytes(),
                source_id: 5,
                hops: 0,
                rssi: None,
                reply_requested: false,
            };
            h.dispatcher.handle(&inbound, &h.relay, &mut h.services);
        }

        let bus = h.host.bus.borrow();
        let state = bus
            .effects()
            .into_iter()
            .find_map(|e| match e {
                MeshEvent::ExternalStoneState(state) => Some(*state),
                _ => None,
            })
            .unwrap();
        assert_eq!(state.stone_id, 5);
        assert_eq!(state.rssi, None);
    }

    #[test]
    fn ack_has_no_handler() {
        let mut h = Harness::new();
        let reply = h.receive(&MeshMessage::Ack, 5).unwrap();
        assert_eq!(reply.return_code, ReturnCode::InvalidMessage);
        assert_eq!(h.host.bus.borrow().received_types(), vec![MessageType::Ack]);
    }

    #[test]
    fn no_reply_unless_requested() {
        let mut h = Harness::new();
        let frame = Frame::encode(MessageType::Noop, &[]).unwrap();
        assert!(h.receive_raw(frame.as_bytes(), 5, false).is_none());
        assert_eq!(
            h.receive_raw(frame.as_bytes(), 5, true).unwrap().return_code,
            ReturnCode::Success
        );
    }

    #[test]
    fn loopback_is_dropped() {
        let mut h = Harness::new();
        assert!(h.receive(&MeshMessage::Noop, OWN).is_none());
        assert!(h.host.bus.borrow().events.is_empty());
    }

    #[test]
    fn results_are_published_not_answered() {
        let mut h = Harness::new();
        let result = ReplyEnvelope::new(MessageType::StateSet, ReturnCode::NoAccess).to_message();
        assert!(h.receive(&result, 5).is_none());
        let bus = h.host.bus.borrow();
        match &bus.effects()[..] {
            [MeshEvent::ResultReceived { source_id, reply }] => {
                assert_eq!(*source_id, 5);
                assert_eq!(reply.return_code, ReturnCode::NoAccess);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_counter_gaps_are_dropped_messages() {
        let mut h = Harness::new();
        for counter in [1, 2, 2, 5] {
            h.receive(
                &MeshMessage::Test(TestPayload {
                    counter: Le32::new(counter),
                    dummy: [0; 3],
                }),
                5,
            );
        }
        let stats = h.dispatcher.test_stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.last_counter, Some(5));
    }

    #[test]
    fn broadcast_control_command_runs_once() {
        let mut h = Harness::new();
        let msg = MeshMessage::ControlCommand {
            header: ControlCommandHeader {
                target_id: 0,
                command_type: Le16::new(CommandType::Switch.into()),
                access_level: 0,
                source: SOURCE_ID_SWITCHCRAFT,
            },
            payload: Bytes::from_static(&[0]),
        };
        let reply = h.receive(&msg, 5).unwrap();
        assert_eq!(reply.return_code, ReturnCode::Success);
        assert_eq!(h.host.executor.borrow().calls.len(), 1);
        assert_eq!(h.host.bus.borrow().received_types(), vec![MessageType::ControlCommand]);
    }
}
