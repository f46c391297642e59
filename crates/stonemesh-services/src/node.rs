//! `MeshNode` — one node's engine, driven by a single run loop.
//!
//! The run loop calls `tick` every `queue.process_interval_ms`, `on_frame`
//! for every received envelope and `on_reliable_complete` when the transport
//! finishes a reliable send. None of these block.

use std::time::Duration;

use tokio::sync::oneshot;

use stonemesh_core::config::StonemeshConfig;
use stonemesh_core::wire::{MessageType, StoneId};
use stonemesh_core::MeshMessage;

use crate::dispatcher::{IncomingDispatcher, TestStats};
use crate::error::EngineError;
use crate::local::LocalServices;
use crate::outgoing::OutgoingQueue;
use crate::relay::{CommandDispatch, CommandRelay, MeshCommand};
use crate::reliable::ReliableSender;
use crate::sender::{MeshSender, OwnState};
use crate::transport::{Inbound, MeshTransport, ReliableStatus};

pub struct MeshNode {
    own_id: StoneId,
    burst_count: usize,
    sender: MeshSender,
    reliable: ReliableSender,
    dispatcher: IncomingDispatcher,
    relay: CommandRelay,
    transport: Box<dyn MeshTransport>,
    services: LocalServices,
}

impl MeshNode {
    pub fn new(
        config: &StonemeshConfig,
        transport: Box<dyn MeshTransport>,
        services: LocalServices,
    ) -> Self {
        let own_id = config.node.stone_id;
        let repeats = config.queue.repeats.clone();
        tracing::info!(
            own_id,
            capacity = config.queue.capacity,
            burst_count = config.queue.burst_count,
            "mesh node initialised"
        );
        Self {
            own_id,
            burst_count: config.queue.burst_count,
            relay: CommandRelay::new(own_id, repeats.medium),
            sender: MeshSender::new(OutgoingQueue::new(config.queue.capacity), repeats),
            reliable: ReliableSender::new(Duration::from_millis(config.reliable.timeout_ms)),
            dispatcher: IncomingDispatcher::new(own_id),
            transport,
            services,
        }
    }

    pub fn own_id(&self) -> StoneId {
        self.own_id
    }

    /// Periodic drain. Returns the number of envelopes sent.
    pub fn tick(&mut self) -> usize {
        self.sender.drain_burst(
            self.burst_count,
            self.transport.as_mut(),
            self.services.clock.as_ref(),
        )
    }

    /// Dispatch one received envelope and send the reply, if any.
    pub fn on_frame(&mut self, inbound: Inbound<'_>) {
        let Some(reply) = self
            .dispatcher
            .handle(&inbound, &self.relay, &mut self.services)
        else {
            return;
        };
        let frame = match reply.to_message().encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, to = inbound.source_id, "reply does not fit an envelope");
                return;
            }
        };
        if let Err(e) = self.transport.send_reply(inbound.source_id, frame.as_bytes()) {
            tracing::warn!(error = %e, to = inbound.source_id, "reply not sent");
        }
    }

    /// The transport finished the outstanding reliable send.
    pub fn on_reliable_complete(&mut self, status: ReliableStatus) -> bool {
        self.reliable
            .on_completion(status, self.services.bus.as_mut())
    }

    // ── Outbound API ──────────────────────────────────────────────────────────

    pub fn sender(&self) -> &MeshSender {
        &self.sender
    }

    /// Typed senders for every broadcast the node originates.
    pub fn sender_mut(&mut self) -> &mut MeshSender {
        &mut self.sender
    }

    pub fn enqueue(
        &mut self,
        msg: &MeshMessage,
        target_id: u16,
        repeats: u8,
        priority: bool,
    ) -> Result<usize, EngineError> {
        self.sender.enqueue(msg, target_id, repeats, priority)
    }

    pub fn cancel(&mut self, msg_type: MessageType, target_id: u16) -> bool {
        self.sender.cancel(msg_type, target_id)
    }

    pub fn send_reliable(
        &mut self,
        target_id: StoneId,
        msg: &MeshMessage,
    ) -> Result<oneshot::Receiver<ReliableStatus>, EngineError> {
        self.reliable.send(target_id, msg, self.transport.as_mut())
    }

    pub fn reliable_busy(&self) -> bool {
        self.reliable.is_busy()
    }

    /// Broadcast this node's state as two parts.
    pub fn send_own_state(&mut self, state: OwnState) -> Result<u16, EngineError> {
        self.sender
            .send_own_state(state, self.services.clock.as_ref())
    }

    /// Run a state or control request on a set of nodes.
    pub fn send_mesh_command(&mut self, cmd: MeshCommand) -> Result<CommandDispatch, EngineError> {
        self.relay.send_command(
            cmd,
            &mut self.services,
            &mut self.sender,
            &mut self.reliable,
            self.transport.as_mut(),
        )
    }

    pub fn test_stats(&self) -> &TestStats {
        self.dispatcher.test_stats()
    }
}
