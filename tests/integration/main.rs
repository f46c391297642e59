//! Stonemesh integration test harness.
//!
//! Several `MeshNode`s are wired to one in-memory fabric. Best-effort frames
//! reach every other node; reliable frames reach their target, whose reply
//! travels back to the originator and completes the reliable send.
//!
//!   cargo test --test integration

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use stonemesh_core::config::StonemeshConfig;
use stonemesh_core::StoneId;
use stonemesh_services::mock::MockHost;
use stonemesh_services::{Inbound, MeshNode, MeshTransport, ReliableStatus, TransportError};

mod broadcast;
mod commands;

// ── Fabric ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Delivery {
    Flood,
    Reliable { target: StoneId },
    Reply { to: StoneId },
}

#[derive(Debug, Clone)]
struct Datagram {
    src: StoneId,
    delivery: Delivery,
    frame: Vec<u8>,
}

#[derive(Debug, Default)]
struct FabricState {
    in_flight: VecDeque<Datagram>,
    /// Nodes that currently hold the reliable slot.
    reliable_busy: Vec<StoneId>,
    /// Stone IDs cut off from the fabric.
    down: Vec<StoneId>,
}

type Fabric = Rc<RefCell<FabricState>>;

struct FabricTransport {
    id: StoneId,
    fabric: Fabric,
}

impl FabricTransport {
    fn push(&self, delivery: Delivery, frame: &[u8]) {
        self.fabric.borrow_mut().in_flight.push_back(Datagram {
            src: self.id,
            delivery,
            frame: frame.to_vec(),
        });
    }
}

impl MeshTransport for FabricTransport {
    fn send_best_effort(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.push(Delivery::Flood, frame);
        Ok(())
    }

    fn send_reliable(
        &mut self,
        target: StoneId,
        frame: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.fabric.borrow().reliable_busy.contains(&self.id) {
            return Err(TransportError::Busy);
        }
        self.fabric.borrow_mut().reliable_busy.push(self.id);
        self.push(Delivery::Reliable { target }, frame);
        Ok(())
    }

    fn reliable_slot_free(&self) -> bool {
        !self.fabric.borrow().reliable_busy.contains(&self.id)
    }

    fn send_reply(&mut self, to: StoneId, frame: &[u8]) -> Result<(), TransportError> {
        self.push(Delivery::Reply { to }, frame);
        Ok(())
    }
}

// ── Mesh ──────────────────────────────────────────────────────────────────────

pub struct TestNode {
    pub node: MeshNode,
    pub host: MockHost,
}

pub struct Mesh {
    fabric: Fabric,
    nodes: Vec<TestNode>,
}

impl Mesh {
    /// One node per id, default config otherwise.
    pub fn new(ids: &[StoneId]) -> Self {
        Self::with_config(ids, |_| {})
    }

    pub fn with_config(ids: &[StoneId], tweak: impl Fn(&mut StonemeshConfig)) -> Self {
        let fabric = Fabric::default();
        let nodes = ids
            .iter()
            .map(|&id| {
                let mut config = StonemeshConfig::default();
                config.node.stone_id = id;
                tweak(&mut config);
                let (services, host) = MockHost::new();
                let transport = FabricTransport {
                    id,
                    fabric: fabric.clone(),
                };
                TestNode {
                    node: MeshNode::new(&config, Box::new(transport), services),
                    host,
                }
            })
            .collect();
        Self { fabric, nodes }
    }

    pub fn node(&mut self, id: StoneId) -> &mut TestNode {
        self.nodes
            .iter_mut()
            .find(|n| n.node.own_id() == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    /// Cut a node off: it neither sends nor receives.
    pub fn take_down(&mut self, id: StoneId) {
        self.fabric.borrow_mut().down.push(id);
    }

    /// Deliver everything in flight, including frames produced while
    /// delivering. Returns the number of datagrams delivered.
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.fabric.borrow_mut().in_flight.pop_front();
            let Some(datagram) = next else {
                return delivered;
            };
            delivered += 1;
            let down = self.fabric.borrow().down.clone();
            if down.contains(&datagram.src) {
                continue;
            }
            for n in self.nodes.iter_mut() {
                let id = n.node.own_id();
                if id == datagram.src || down.contains(&id) {
                    continue;
                }
                match datagram.delivery {
                    Delivery::Flood => n.node.on_frame(inbound(&datagram, false)),
                    Delivery::Reliable { target } if target == id => {
                        n.node.on_frame(inbound(&datagram, true))
                    }
                    Delivery::Reply { to } if to == id => {
                        n.node.on_frame(inbound(&datagram, false));
                        if n.node.reliable_busy() {
                            self.fabric.borrow_mut().reliable_busy.retain(|&b| b != id);
                            n.node.on_reliable_complete(ReliableStatus::Success);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Tick every node and deliver, `rounds` times.
    pub fn run(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for n in self.nodes.iter_mut() {
                n.node.tick();
            }
            self.deliver();
        }
    }

    /// Report a timeout for a node's outstanding reliable send.
    pub fn expire_reliable(&mut self, id: StoneId) {
        self.fabric.borrow_mut().reliable_busy.retain(|&b| b != id);
        self.node(id).node.on_reliable_complete(ReliableStatus::Timeout);
    }
}

fn inbound(datagram: &Datagram, reply_requested: bool) -> Inbound<'_> {
    Inbound {
        data: &datagram.frame,
        source_id: datagram.src,
        hops: 0,
        rssi: Some(-55),
        reply_requested,
    }
}
