//! Outgoing queue — fixed table of best-effort broadcasts.
//!
//! Each item is sent `repeats` times, spread over ticks. A slot whose repeat
//! count reached zero is free. Items are keyed by `(type, target_id)`; a new
//! item for the same key replaces the pending one.
//!
//! Selection per send:
//!   1. first priority item at or after `next`, wrapping
//!   2. otherwise first item with repeats left at or after `next`
//!
//! After a send `next` moves to the slot after it, so items interleave across
//! ticks instead of one item using up its repeats first.

use zerocopy::AsBytes;

use stonemesh_core::wire::{Le32, MessageType, TimePayload, MAX_MESH_PAYLOAD};
use stonemesh_core::Frame;

use crate::error::EngineError;
use crate::local::Clock;
use crate::transport::MeshTransport;

/// One queue slot.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub msg_type: MessageType,
    /// Per-type discriminator: Stone ID, device id, or 0 for singletons.
    pub target_id: u16,
    payload: [u8; MAX_MESH_PAYLOAD],
    payload_len: usize,
    pub repeats_remaining: u8,
    pub priority: bool,
}

impl QueueItem {
    const FREE: QueueItem = QueueItem {
        msg_type: MessageType::Noop,
        target_id: 0,
        payload: [0u8; MAX_MESH_PAYLOAD],
        payload_len: 0,
        repeats_remaining: 0,
        priority: false,
    };

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len]
    }

    pub fn is_free(&self) -> bool {
        self.repeats_remaining == 0
    }

    fn matches(&self, msg_type: MessageType, target_id: u16) -> bool {
        !self.is_free() && self.msg_type == msg_type && self.target_id == target_id
    }
}

/// Fixed-capacity outgoing queue.
pub struct OutgoingQueue {
    items: Box<[QueueItem]>,
    /// Slot the next scan starts from.
    next: usize,
}

impl OutgoingQueue {
    /// Allocate `capacity` slots. The table never grows.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: vec![QueueItem::FREE; capacity].into_boxed_slice(),
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Number of slots with repeats left.
    pub fn pending(&self) -> usize {
        self.items.iter().filter(|i| !i.is_free()).count()
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Pending item for a key, if any.
    pub fn find(&self, msg_type: MessageType, target_id: u16) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.matches(msg_type, target_id))
    }

    /// Whether every key in `keys` can be enqueued right now. A key with a
    /// pending item reuses that slot; any other key needs a free one.
    pub fn has_room_for(&self, keys: &[(MessageType, u16)]) -> bool {
        let free = self.items.iter().filter(|i| i.is_free()).count();
        let needed = keys
            .iter()
            .filter(|&&(msg_type, target_id)| self.find(msg_type, target_id).is_none())
            .count();
        needed <= free
    }

    /// Queue a broadcast, replacing any pending item with the same key.
    ///
    /// The payload is copied in. Returns the slot index.
    pub fn enqueue(
        &mut self,
        msg_type: MessageType,
        target_id: u16,
        payload: &[u8],
        repeats: u8,
        priority: bool,
    ) -> Result<usize, EngineError> {
        msg_type.check_payload_len(payload.len())?;
        if repeats == 0 {
            return Err(EngineError::ZeroRepeats);
        }

        self.cancel(msg_type, target_id);

        // Scan backward from `next`: next, next-1, ..., next+1.
        let size = self.items.len();
        let slot = (1..=size)
            .rev()
            .map(|i| (self.next + i) % size)
            .find(|&index| self.items[index].is_free());

        let Some(index) = slot else {
            tracing::warn!(
                msg_type = ?msg_type,
                target_id,
                capacity = size,
                "outgoing queue full"
            );
            return Err(EngineError::QueueFull);
        };

        let item = &mut self.items[index];
        item.msg_type = msg_type;
        item.target_id = target_id;
        item.payload[..payload.len()].copy_from_slice(payload);
        item.payload_len = payload.len();
        item.repeats_remaining = repeats;
        item.priority = priority;
        self.next = index;

        tracing::debug!(
            index,
            msg_type = ?msg_type,
            target_id,
            repeats,
            priority,
            payload = hex::encode(payload),
            "queued"
        );
        Ok(index)
    }

    /// Drop the pending item for a key. Returns true if one was pending.
    pub fn cancel(&mut self, msg_type: MessageType, target_id: u16) -> bool {
        let mut removed = false;
        for item in self.items.iter_mut() {
            if item.matches(msg_type, target_id) {
                item.repeats_remaining = 0;
                removed = true;
            }
        }
        if removed {
            tracing::trace!(msg_type = ?msg_type, target_id, "cancelled queued item");
        }
        removed
    }

    /// Send up to `max_items` frames. Returns how many were handed to the
    /// transport.
    pub fn drain_burst(
        &mut self,
        max_items: usize,
        transport: &mut dyn MeshTransport,
        clock: &dyn Clock,
    ) -> usize {
        let mut sent = 0;
        while sent < max_items {
            if !self.send_next(transport, clock) {
                break;
            }
            sent += 1;
        }
        sent
    }

    fn next_index(&self, priority_only: bool) -> Option<usize> {
        let size = self.items.len();
        (self.next..self.next + size)
            .map(|i| i % size)
            .find(|&index| {
                let item = &self.items[index];
                !item.is_free() && (!priority_only || item.priority)
            })
    }

    fn send_next(&mut self, transport: &mut dyn MeshTransport, clock: &dyn Clock) -> bool {
        let Some(index) = self.next_index(true).or_else(|| self.next_index(false)) else {
            return false;
        };

        let item = &mut self.items[index];
        if item.msg_type == MessageType::StateTime {
            let now = clock.now_posix();
            if now != 0 {
                let time = TimePayload {
                    timestamp: Le32::new(now),
                };
                item.payload[..item.payload_len].copy_from_slice(time.as_bytes());
            }
        }

        match Frame::encode(item.msg_type, item.payload()) {
            Ok(frame) => {
                if let Err(e) = transport.send_best_effort(frame.as_bytes()) {
                    tracing::warn!(error = %e, index, msg_type = ?item.msg_type, "send failed");
                }
            }
            Err(e) => {
                // Validated at enqueue. Free the slot.
                tracing::error!(error = %e, index, "queued item no longer encodes");
                item.repeats_remaining = 1;
            }
        }

        item.repeats_remaining -= 1;
        tracing::trace!(
            index,
            msg_type = ?item.msg_type,
            repeats_left = item.repeats_remaining,
            "sent from queue"
        );
        self.next = (index + 1) % self.items.len();
        true
    }
}
