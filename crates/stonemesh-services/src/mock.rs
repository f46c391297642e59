//! Recording collaborators for tests.
//!
//! Each fake shares its log through `Rc<RefCell<..>>` so a test can hand the
//! fake to the engine and still inspect what happened.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use stonemesh_core::access::{AccessLevel, CmdSource, CommandType};
use stonemesh_core::wire::{MessageType, PersistenceMode, StoneId};
use stonemesh_core::{ReplyEnvelope, ReturnCode};

use bytes::Bytes;

use crate::event::{EventBus, Handled, MeshEvent};
use crate::local::{
    Clock, CommandExecutor, CommandOutcome, DefaultPermissions, LocalServices, MemoryStateStore,
    StateKey, StateStore,
};
use crate::transport::{MeshTransport, TransportError};

// ── Transport ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TransportLog {
    pub best_effort: Vec<Vec<u8>>,
    pub reliable: Vec<(StoneId, Vec<u8>, Duration)>,
    pub replies: Vec<(StoneId, Vec<u8>)>,
    pub fail_best_effort: bool,
    pub reliable_busy: bool,
}

pub struct RecordingTransport {
    log: Rc<RefCell<TransportLog>>,
}

impl RecordingTransport {
    pub fn new() -> (Self, Rc<RefCell<TransportLog>>) {
        let log = Rc::new(RefCell::new(TransportLog::default()));
        (Self { log: log.clone() }, log)
    }
}

impl MeshTransport for RecordingTransport {
    fn send_best_effort(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut log = self.log.borrow_mut();
        log.best_effort.push(frame.to_vec());
        if log.fail_best_effort {
            return Err(TransportError::LinkDown("test".into()));
        }
        Ok(())
    }

    fn send_reliable(
        &mut self,
        target: StoneId,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut log = self.log.borrow_mut();
        if log.reliable_busy {
            return Err(TransportError::Busy);
        }
        log.reliable.push((target, frame.to_vec(), timeout));
        Ok(())
    }

    fn reliable_slot_free(&self) -> bool {
        !self.log.borrow().reliable_busy
    }

    fn send_reply(&mut self, to: StoneId, frame: &[u8]) -> Result<(), TransportError> {
        self.log.borrow_mut().replies.push((to, frame.to_vec()));
        Ok(())
    }
}

// ── Event bus ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct BusLog {
    pub events: Vec<MeshEvent>,
    /// Claim `MessageReceived` for this type, answering with the reply.
    pub claim: Option<(MessageType, Option<ReplyEnvelope>)>,
}

impl BusLog {
    pub fn received_types(&self) -> Vec<MessageType> {
        self.events
            .iter()
            .filter_map(|e| match e {
                MeshEvent::MessageReceived { msg_type, .. } => Some(*msg_type),
                _ => None,
            })
            .collect()
    }

    /// Events other than `MessageReceived`.
    pub fn effects(&self) -> Vec<&MeshEvent> {
        self.events
            .iter()
            .filter(|e| !matches!(e, MeshEvent::MessageReceived { .. }))
            .collect()
    }
}

pub struct RecordingBus {
    log: Rc<RefCell<BusLog>>,
}

impl EventBus for RecordingBus {
    fn dispatch(&mut self, event: &MeshEvent) -> Handled {
        let mut log = self.log.borrow_mut();
        log.events.push(event.clone());
        match (event, &log.claim) {
            (MeshEvent::MessageReceived { msg_type, .. }, Some((claimed, reply)))
                if msg_type == claimed =>
            {
                Handled::Claimed {
                    reply: reply.clone(),
                }
            }
            _ => Handled::Unhandled,
        }
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Clock set by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new(now: u32) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.set(now);
    }
}

impl Clock for ManualClock {
    fn now_posix(&self) -> u32 {
        self.now.get()
    }
}

// ── State store ───────────────────────────────────────────────────────────────

pub struct SharedStore {
    inner: Rc<RefCell<MemoryStateStore>>,
}

impl StateStore for SharedStore {
    fn set_state(
        &mut self,
        key: StateKey,
        value: &[u8],
        persistence: PersistenceMode,
    ) -> ReturnCode {
        self.inner.borrow_mut().set_state(key, value, persistence)
    }

    fn get_state(
        &mut self,
        key: StateKey,
        persistence: PersistenceMode,
    ) -> Result<Bytes, ReturnCode> {
        self.inner.borrow_mut().get_state(key, persistence)
    }
}

// ── Command executor ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub command: CommandType,
    pub payload: Vec<u8>,
    pub access: AccessLevel,
    pub source: CmdSource,
}

#[derive(Debug)]
pub struct ExecutorLog {
    pub calls: Vec<ExecutedCommand>,
    /// Returned for every call.
    pub outcome: CommandOutcome,
}

impl Default for ExecutorLog {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            outcome: CommandOutcome::code(ReturnCode::Success),
        }
    }
}

pub struct RecordingExecutor {
    log: Rc<RefCell<ExecutorLog>>,
}

impl CommandExecutor for RecordingExecutor {
    fn execute(
        &mut self,
        command: CommandType,
        payload: &[u8],
        access: AccessLevel,
        source: CmdSource,
    ) -> CommandOutcome {
        let mut log = self.log.borrow_mut();
        log.calls.push(ExecutedCommand {
            command,
            payload: payload.to_vec(),
            access,
            source,
        });
        log.outcome.clone()
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// Handles onto the fakes behind a `LocalServices`.
#[derive(Clone)]
pub struct MockHost {
    pub bus: Rc<RefCell<BusLog>>,
    pub store: Rc<RefCell<MemoryStateStore>>,
    pub executor: Rc<RefCell<ExecutorLog>>,
    pub clock: ManualClock,
}

impl MockHost {
    /// Fresh fakes with an unset clock and encryption enabled.
    pub fn new() -> (LocalServices, MockHost) {
        Self::with_permissions(DefaultPermissions::new(true))
    }

    pub fn with_permissions(permissions: DefaultPermissions) -> (LocalServices, MockHost) {
        let host = MockHost {
            bus: Rc::default(),
            store: Rc::default(),
            executor: Rc::default(),
            clock: ManualClock::new(0),
        };
        let services = LocalServices {
            bus: Box::new(RecordingBus {
                log: host.bus.clone(),
            }),
            store: Box::new(SharedStore {
                inner: host.store.clone(),
            }),
            executor: Box::new(RecordingExecutor {
                log: host.executor.clone(),
            }),
            clock: Box::new(host.clock.clone()),
            permissions: Box::new(permissions),
        };
        (services, host)
    }
}
