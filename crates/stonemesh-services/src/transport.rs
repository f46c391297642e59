//! Transport trait — the radio (or link) underneath the engine.
//!
//! The engine hands the transport whole envelopes. Flooding, hop counting and
//! reliable retransmission happen below this line.

use std::time::Duration;

use stonemesh_core::StoneId;

/// Final status of a reliable send, reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableStatus {
    Success,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport busy")]
    Busy,
    #[error("link down: {0}")]
    LinkDown(String),
    #[error("frame rejected by transport: {0}")]
    Rejected(String),
}

/// Sends envelopes into the mesh.
///
/// All calls are made from the run loop and must not block.
pub trait MeshTransport {
    /// Publish once without acknowledgement. Repeats are the queue's job.
    fn send_best_effort(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Publish to `target` and wait for its reply or acknowledgement.
    /// Completion is reported later through `MeshNode::on_reliable_complete`.
    fn send_reliable(
        &mut self,
        target: StoneId,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Whether the transport can accept another reliable send.
    fn reliable_slot_free(&self) -> bool;

    /// Answer a request that arrived from `to`.
    fn send_reply(&mut self, to: StoneId, frame: &[u8]) -> Result<(), TransportError>;
}

/// One envelope as received from the transport.
///
/// The data borrows the receive buffer and is only valid for the call.
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub data: &'a [u8],
    pub source_id: StoneId,
    /// Relay hops the frame took. 0 = heard directly.
    pub hops: u8,
    /// `None` when the link cannot measure signal strength.
    pub rssi: Option<i8>,
    /// The sender expects a `Result` reply.
    pub reply_requested: bool,
}
