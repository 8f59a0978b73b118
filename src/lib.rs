//! Raft consensus with pre-vote, leader stickiness, promotable members, streamed
//! snapshots and cluster management on top.
//!
//! A node is a [`RaftEngine`] fed by a [`MessageBus`]. Outbound messages go through a
//! [`Network`] implementation (normally [`transport::TransportSender`]); inbound
//! requests arrive through a [`transport::RequestHandler`].

pub mod bus;
pub mod cluster;
pub mod codec;
pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod state;
pub mod storage;
pub mod timer;
pub mod topology;
pub mod traits;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use bus::MessageBus;
pub use engine::{EngineDeps, RaftEngine};
pub use error::{ClientError, ClusterError, RaftError, TopologyError, TransportError};
pub use event::{ClientResult, Event, Role};
pub use message::{LogEntry, SnapshotMeta};
pub use state::{EngineStatus, RaftOptions, RaftState, RaftStateDeps};
pub use topology::{Membership, Topology, TopologyChange};
pub use traits::{Network, StateMachine, Storage, TimerService};
pub use types::{NodeConnectionInfo, NodeName, TimerId, TopologyId};
