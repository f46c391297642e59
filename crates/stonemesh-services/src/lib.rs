//! stonemesh-services — the mesh queueing and dispatch engine.
//!
//! Outbound: `MeshSender` → `OutgoingQueue` → transport, plus the single-slot
//! `ReliableSender`. Inbound: transport → `IncomingDispatcher` → local bus,
//! built-in handlers, `StateAggregator` or `CommandRelay`. `MeshNode` ties
//! them to one transport and one set of local collaborators.

pub mod aggregator;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod local;
pub mod node;
pub mod outgoing;
pub mod relay;
pub mod reliable;
pub mod sender;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use aggregator::{ExternalState, StateAggregator};
pub use dispatcher::{IncomingDispatcher, TestStats};
pub use error::EngineError;
pub use event::{EventBus, Handled, MeshEvent};
pub use local::{
    Clock, CommandExecutor, CommandOutcome, DefaultPermissions, LocalServices, MemoryStateStore,
    PermissionOracle, StateKey, StateOp, StateStore,
};
pub use node::MeshNode;
pub use outgoing::OutgoingQueue;
pub use relay::{CommandDispatch, CommandRelay, MeshCommand, RemoteRequest};
pub use reliable::ReliableSender;
pub use sender::{MeshSender, OwnState};
pub use transport::{Inbound, MeshTransport, ReliableStatus, TransportError};
