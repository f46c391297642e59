//! Reliable request adapter — a single in-flight acknowledged send.
//!
//! The adapter owns the encoded frame until the transport reports an
//! outcome. Callers get a oneshot receiver that resolves with that outcome.
//! Timeouts are not retried here.

use std::time::Duration;

use tokio::sync::oneshot;

use stonemesh_core::wire::StoneId;
use stonemesh_core::{Frame, MeshMessage};

use crate::error::EngineError;
use crate::event::{EventBus, MeshEvent};
use crate::transport::{MeshTransport, ReliableStatus, TransportError};

struct InFlight {
    frame: Frame,
    target_id: StoneId,
    notifier: oneshot::Sender<ReliableStatus>,
}

pub struct ReliableSender {
    in_flight: Option<InFlight>,
    timeout: Duration,
}

impl ReliableSender {
    pub fn new(timeout: Duration) -> Self {
        Self {
            in_flight: None,
            timeout,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Frame of the outstanding send, if any.
    pub fn in_flight(&self) -> Option<&Frame> {
        self.in_flight.as_ref().map(|f| &f.frame)
    }

    /// Submit `msg` to `target_id`. Fails with `Busy` while another reliable
    /// send is outstanding.
    pub fn send(
        &mut self,
        target_id: StoneId,
        msg: &MeshMessage,
        transport: &mut dyn MeshTransport,
    ) -> Result<oneshot::Receiver<ReliableStatus>, EngineError> {
        if self.is_busy() || !transport.reliable_slot_free() {
            tracing::debug!(msg_type = ?msg.msg_type(), target_id, "reliable slot busy");
            return Err(EngineError::Busy);
        }

        let frame = msg.encode()?;
        transport
            .send_reliable(target_id, frame.as_bytes(), self.timeout)
            .map_err(|e| match e {
                TransportError::Busy => EngineError::Busy,
                other => EngineError::Transport(other),
            })?;

        tracing::debug!(
            msg_type = ?frame.msg_type(),
            target_id,
            frame = hex::encode(frame.as_bytes()),
            timeout_ms = self.timeout.as_millis() as u64,
            "reliable send submitted"
        );

        let (notifier, receiver) = oneshot::channel();
        self.in_flight = Some(InFlight {
            frame,
            target_id,
            notifier,
        });
        Ok(receiver)
    }

    /// Transport reported the outcome of the outstanding send. Frees the slot,
    /// resolves the caller's receiver and publishes `ReliableOutcome`.
    pub fn on_completion(&mut self, status: ReliableStatus, bus: &mut dyn EventBus) -> bool {
        let Some(done) = self.in_flight.take() else {
            tracing::warn!(?status, "reliable completion with nothing in flight");
            return false;
        };

        let msg_type = done.frame.msg_type();
        match status {
            ReliableStatus::Success => {
                tracing::debug!(msg_type = ?msg_type, target_id = done.target_id, "reliable send acknowledged")
            }
            ReliableStatus::Timeout => {
                tracing::info!(msg_type = ?msg_type, target_id = done.target_id, "reliable send timed out")
            }
            ReliableStatus::Cancelled => {
                tracing::info!(msg_type = ?msg_type, target_id = done.target_id, "reliable send cancelled")
            }
        }

        // The caller may have dropped its receiver.
        let _ = done.notifier.send(status);
        bus.dispatch(&MeshEvent::ReliableOutcome {
            msg_type,
            target_id: done.target_id,
            status,
        });
        true
    }
}
