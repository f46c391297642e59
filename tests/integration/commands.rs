//! Remote state and control commands between nodes.

use bytes::Bytes;

use stonemesh_core::access::{AccessLevel, CmdSource, CommandType, SourceKind, SOURCE_ID_CONNECTION};
use stonemesh_core::wire::{MessageType, PersistenceMode, BROADCAST_ID};
use stonemesh_core::{ReplyEnvelope, ReturnCode, StoneId};
use stonemesh_services::{
    EngineError, MeshCommand, MeshEvent, ReliableStatus, RemoteRequest, StateKey, StateStore,
};

use crate::Mesh;

const KEY: StateKey = StateKey {
    state_type: 40,
    state_id: 0,
};

/// One repeat per forwarded command, so every node sees it once.
fn mesh(ids: &[StoneId]) -> Mesh {
    Mesh::with_config(ids, |config| config.queue.repeats.medium = 1)
}

fn phone() -> CmdSource {
    CmdSource::new(SourceKind::Enum, SOURCE_ID_CONNECTION)
}

fn switch(target_ids: Vec<StoneId>) -> MeshCommand {
    MeshCommand {
        target_ids,
        request: RemoteRequest::Control {
            command: CommandType::Switch,
            payload: Bytes::from_static(&[100]),
        },
        access: AccessLevel::Basic,
        source: phone(),
        reliable: false,
    }
}

fn state_set(target: StoneId, access: AccessLevel, value: u8) -> MeshCommand {
    MeshCommand {
        target_ids: vec![target],
        request: RemoteRequest::StateSet {
            key: KEY,
            persistence: PersistenceMode::Auto,
            value: Bytes::copy_from_slice(&[value]),
        },
        access,
        source: phone(),
        reliable: true,
    }
}

fn executed(mesh: &mut Mesh, id: StoneId) -> usize {
    mesh.node(id).host.executor.borrow().calls.len()
}

fn results(mesh: &mut Mesh, id: StoneId) -> Vec<(StoneId, ReplyEnvelope)> {
    mesh.node(id)
        .host
        .bus
        .borrow()
        .events
        .iter()
        .filter_map(|e| match e {
            MeshEvent::ResultReceived { source_id, reply } => Some((*source_id, reply.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn broadcast_command_runs_once_per_node() {
    let mut mesh = mesh(&[1, 2, 3]);
    let dispatch = mesh.node(1).node.send_mesh_command(switch(vec![])).unwrap();
    assert_eq!(dispatch.forwarded, vec![BROADCAST_ID]);
    assert_eq!(dispatch.local.unwrap().return_code, ReturnCode::Success);
    mesh.run(4);

    for id in [1, 2, 3] {
        assert_eq!(executed(&mut mesh, id), 1, "node {id}");
    }
    let executor = mesh.node(2).host.executor.borrow();
    let calls = &executor.calls;
    assert_eq!(calls[0].command, CommandType::Switch);
    assert!(calls[0].source.external);
    assert_eq!(calls[0].access, AccessLevel::Basic);
}

#[test]
fn subset_command_skips_unaddressed_nodes() {
    let mut mesh = mesh(&[1, 2, 3]);
    let dispatch = mesh.node(1).node.send_mesh_command(switch(vec![1, 3])).unwrap();
    assert_eq!(dispatch.forwarded, vec![3]);
    mesh.run(4);

    assert_eq!(executed(&mut mesh, 1), 1);
    assert_eq!(executed(&mut mesh, 2), 0);
    assert_eq!(executed(&mut mesh, 3), 1);
}

#[test]
fn state_set_needs_the_state_types_own_access() {
    let mut mesh = mesh(&[1, 2]);

    // Basic is enough for the generic state command but not for setting
    // state type 40.
    let mut pending = mesh
        .node(1)
        .node
        .send_mesh_command(state_set(2, AccessLevel::Basic, 7))
        .unwrap()
        .pending
        .unwrap();
    mesh.deliver();

    assert_eq!(pending.try_recv().unwrap(), ReliableStatus::Success);
    assert!(mesh.node(2).host.store.borrow().value(KEY).is_none());
    let replies = results(&mut mesh, 1);
    assert_eq!(replies.len(), 1);
    let (from, reply) = &replies[0];
    assert_eq!(*from, 2);
    assert_eq!(reply.request_type(), Some(MessageType::StateSet));
    assert_eq!(reply.return_code, ReturnCode::NoAccess);
    assert_eq!(reply.payload[0], 2);
    assert_eq!(reply.payload[1], KEY.state_type);

    mesh.node(1)
        .node
        .send_mesh_command(state_set(2, AccessLevel::Admin, 7))
        .unwrap();
    mesh.deliver();

    assert_eq!(&mesh.node(2).host.store.borrow().value(KEY).unwrap()[..], &[7]);
    let replies = results(&mut mesh, 1);
    assert_eq!(replies[1].1.return_code, ReturnCode::Success);
}

#[test]
fn state_get_returns_the_value() {
    let mut mesh = mesh(&[1, 2]);
    mesh.node(2)
        .host
        .store
        .borrow_mut()
        .set_state(KEY, &[0x12, 0x34], PersistenceMode::Ram);

    mesh.node(1)
        .node
        .send_mesh_command(MeshCommand {
            target_ids: vec![2],
            request: RemoteRequest::StateGet {
                key: KEY,
                persistence: PersistenceMode::Auto,
            },
            access: AccessLevel::Member,
            source: phone(),
            reliable: true,
        })
        .unwrap();
    mesh.deliver();

    let replies = results(&mut mesh, 1);
    let (_, reply) = &replies[0];
    assert_eq!(reply.return_code, ReturnCode::Success);
    assert_eq!(&reply.payload[6..], &[0x12, 0x34]);
}

#[test]
fn control_command_outside_allow_list_is_refused() {
    let mut mesh = mesh(&[1, 2]);
    mesh.node(1)
        .node
        .send_mesh_command(MeshCommand {
            target_ids: vec![2],
            request: RemoteRequest::Control {
                command: CommandType::GotoDfu,
                payload: Bytes::new(),
            },
            access: AccessLevel::Admin,
            source: phone(),
            reliable: true,
        })
        .unwrap();
    mesh.deliver();

    assert_eq!(executed(&mut mesh, 2), 0);
    let replies = results(&mut mesh, 1);
    assert_eq!(replies[0].1.return_code, ReturnCode::NoAccess);
    assert_eq!(&replies[0].1.payload[..], &[11, 0]);
}

#[test]
fn reliable_slot_is_single() {
    let mut mesh = mesh(&[1, 2]);
    mesh.take_down(2);

    let mut pending = mesh
        .node(1)
        .node
        .send_mesh_command(state_set(2, AccessLevel::Admin, 1))
        .unwrap()
        .pending
        .unwrap();
    assert!(matches!(
        mesh.node(1).node.send_mesh_command(state_set(2, AccessLevel::Admin, 2)),
        Err(EngineError::Busy)
    ));
    mesh.deliver();
    assert!(mesh.node(1).node.reliable_busy());

    mesh.expire_reliable(1);
    assert_eq!(pending.try_recv().unwrap(), ReliableStatus::Timeout);
    assert!(mesh.node(1).host.bus.borrow().events.iter().any(|e| matches!(
        e,
        MeshEvent::ReliableOutcome {
            target_id: 2,
            status: ReliableStatus::Timeout,
            ..
        }
    )));
    assert!(mesh
        .node(1)
        .node
        .send_mesh_command(state_set(2, AccessLevel::Admin, 2))
        .is_ok());
}
