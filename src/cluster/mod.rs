//! Cluster management on top of the engine: replicated cluster commands, the
//! administrative endpoints and the client that forwards to the leader.

mod admin;
mod client;
mod command;
mod state_machine;

pub use admin::{AdminHandler, CanJoinResult};
pub use client::{ClusterManagementClient, error_from_response};
pub use command::{ClusterCommand, ClusterConfiguration};
pub use state_machine::{ClusterState, ClusterStateMachine};
