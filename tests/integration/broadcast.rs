//! Best-effort broadcasts across several nodes.

use stonemesh_core::access::{SourceKind, SOURCE_ID_CONNECTION};
use stonemesh_core::wire::{Le16, MultiSwitchItem, SERVICE_DATA_VALIDATION};
use stonemesh_core::StoneId;
use stonemesh_services::{MeshEvent, OwnState};

use crate::Mesh;

fn multi_switch_events(mesh: &mut Mesh, id: StoneId) -> Vec<u8> {
    mesh.node(id)
        .host
        .bus
        .borrow()
        .events
        .iter()
        .filter_map(|e| match e {
            MeshEvent::MultiSwitch { switch_cmd, .. } => Some(*switch_cmd),
            _ => None,
        })
        .collect()
}

fn switch_item(stone_id: StoneId, switch_cmd: u8) -> MultiSwitchItem {
    MultiSwitchItem {
        stone_id,
        switch_cmd,
        delay: Le16::new(0),
        source_kind: SourceKind::Enum as u8,
        source_id: SOURCE_ID_CONNECTION,
    }
}

#[test]
fn own_state_is_merged_once_on_every_other_node() {
    let mut mesh = Mesh::new(&[1, 2, 3]);
    let state = OwnState {
        switch_state: 100,
        flags: 0x02,
        power_factor: 95,
        power_usage_real: 60,
        temperature: 24,
        energy_used: 7_200,
    };
    let partial_timestamp = mesh.node(1).node.send_own_state(state).unwrap();
    mesh.run(3);

    for id in [2, 3] {
        let bus = mesh.node(id).host.bus.borrow();
        let merged: Vec<_> = bus
            .events
            .iter()
            .filter_map(|e| match e {
                MeshEvent::ExternalStoneState(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(merged.len(), 1, "node {id}");
        let s = merged[0];
        assert_eq!(s.stone_id, 1);
        assert_eq!(s.switch_state, 100);
        assert_eq!(s.power_usage_real, 60);
        assert_eq!(s.temperature, 24);
        assert_eq!(s.energy_used, 7_200);
        assert_eq!(s.partial_timestamp, partial_timestamp);
        assert_eq!(s.validation, SERVICE_DATA_VALIDATION);
    }
    assert!(mesh.node(1).host.bus.borrow().events.is_empty());
}

#[test]
fn repeated_set_time_is_applied_once() {
    let mut mesh = Mesh::new(&[1, 2]);
    mesh.node(1).node.sender_mut().send_set_time(1_700_000_000).unwrap();
    mesh.run(5);

    let bus = mesh.node(2).host.bus.borrow();
    // Every repeat is seen, the clock is set once.
    assert_eq!(bus.received_types().len(), 3);
    let set_times: Vec<_> = bus
        .effects()
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::SetTime { .. }))
        .collect();
    assert_eq!(
        set_times,
        vec![&MeshEvent::SetTime {
            timestamp: 1_700_000_000
        }]
    );
}

#[test]
fn multi_switch_only_reaches_its_target() {
    let mut mesh = Mesh::new(&[1, 2, 3]);
    mesh.node(1).node.sender_mut().send_multi_switch(switch_item(2, 100)).unwrap();
    mesh.run(6);

    assert_eq!(multi_switch_events(&mut mesh, 2), vec![100]);
    assert!(multi_switch_events(&mut mesh, 3).is_empty());
}

#[test]
fn newer_switch_command_replaces_unsent_one() {
    let mut mesh = Mesh::new(&[1, 2]);
    let sender = mesh.node(1).node.sender_mut();
    sender.send_multi_switch(switch_item(2, 100)).unwrap();
    sender.send_multi_switch(switch_item(2, 0)).unwrap();
    assert_eq!(sender.queue().pending(), 1);
    mesh.run(6);

    assert_eq!(multi_switch_events(&mut mesh, 2), vec![0]);
}

#[test]
fn unreachable_node_hears_nothing() {
    let mut mesh = Mesh::new(&[1, 2, 3]);
    mesh.take_down(3);
    mesh.node(1).node.sender_mut().send_keep_alive().unwrap();
    mesh.run(3);

    assert!(mesh.node(3).host.bus.borrow().events.is_empty());
    assert!(mesh
        .node(2)
        .host
        .bus
        .borrow()
        .effects()
        .contains(&&MeshEvent::KeepAlive { source_id: 1 }));
}
