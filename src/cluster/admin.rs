//! Administrative endpoints served by every node.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::command::{ClusterCommand, ClusterConfiguration};
use crate::engine::RaftEngine;
use crate::error::{ClientError, TopologyError};
use crate::topology::Membership;
use crate::transport::{Body, Route, Status, WireResponse};
use crate::types::{NodeConnectionInfo, NodeName, TopologyId};

/// Answer of a node asked whether it can join a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanJoinResult {
    CanJoin,
    AlreadyJoined,
    InAnotherCluster,
}

impl CanJoinResult {
    pub fn status(&self) -> Status {
        match self {
            CanJoinResult::CanJoin => Status::Ok,
            CanJoinResult::AlreadyJoined => Status::NotModified,
            CanJoinResult::InAnotherCluster => Status::NotAcceptable,
        }
    }

    /// Inverse of [`CanJoinResult::status`]; `None` for any other status.
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Ok => Some(CanJoinResult::CanJoin),
            Status::NotModified => Some(CanJoinResult::AlreadyJoined),
            Status::NotAcceptable => Some(CanJoinResult::InAnotherCluster),
            _ => None,
        }
    }
}

/// Maps cluster routes onto the local engine.
#[derive(Clone)]
pub struct AdminHandler {
    engine: RaftEngine,
}

impl AdminHandler {
    pub fn new(engine: RaftEngine) -> Self {
        Self { engine }
    }

    pub async fn handle(&self, route: &Route, body: Body) -> WireResponse {
        debug!("Node {} handling {}", self.engine.name(), route);
        match route {
            Route::Join => match body.decode::<NodeConnectionInfo>() {
                Ok(node) => self.join(node).await,
                Err(err) => bad_request(&err.to_string()),
            },
            Route::CanJoin { topology_id } => {
                let result = self.can_join(*topology_id);
                WireResponse::json(result.status(), &result)
            }
            Route::Leave { name } => self.leave(name.clone()).await,
            Route::ClusterConfiguration => match body.decode::<ClusterConfiguration>() {
                Ok(configuration) => {
                    self.append(ClusterCommand::ClusterConfigurationUpdate { configuration })
                        .await
                }
                Err(err) => bad_request(&err.to_string()),
            },
            Route::DatabaseUpdate { name } => match body.decode::<serde_json::Value>() {
                Ok(document) => {
                    self.append(ClusterCommand::DatabaseUpdate {
                        name: name.clone(),
                        document,
                    })
                    .await
                }
                Err(err) => bad_request(&err.to_string()),
            },
            Route::DatabaseDelete { name, hard_delete } => {
                self.append(ClusterCommand::DatabaseDeleted {
                    name: name.clone(),
                    hard_delete: *hard_delete,
                })
                .await
            }
            Route::Raft { .. } | Route::OAuth { .. } => {
                WireResponse::error(Status::NotFound, "NotFound", &route.path())
            }
        }
    }

    /// A fresh node can join anyone; a member of `topology_id` already has.
    pub fn can_join(&self, topology_id: TopologyId) -> CanJoinResult {
        let topology = self.engine.current_topology();
        if topology.topology_id == topology_id {
            CanJoinResult::AlreadyJoined
        } else if topology.is_empty() {
            CanJoinResult::CanJoin
        } else {
            CanJoinResult::InAnotherCluster
        }
    }

    async fn join(&self, node: NodeConnectionInfo) -> WireResponse {
        info!("Node {} adding {} to the cluster", self.engine.name(), node);
        match self.engine.add_to_cluster(node, Membership::Voter).await {
            Ok(()) => WireResponse::json(Status::Ok, &CanJoinResult::CanJoin),
            Err(ClientError::Topology(TopologyError::AlreadyMember(_))) => {
                WireResponse::json(Status::NotModified, &CanJoinResult::AlreadyJoined)
            }
            Err(err) => client_error(err),
        }
    }

    async fn leave(&self, name: NodeName) -> WireResponse {
        info!("Node {} removing {} from the cluster", self.engine.name(), name);
        match self.engine.remove_from_cluster(name).await {
            Ok(()) => WireResponse::empty(Status::Ok),
            Err(err) => client_error(err),
        }
    }

    async fn append(&self, command: ClusterCommand) -> WireResponse {
        let data = match command.encode() {
            Ok(data) => data,
            Err(err) => return bad_request(&err.to_string()),
        };
        match self.engine.append_command(data).await {
            Ok(index) => WireResponse::json(Status::Ok, &serde_json::json!({ "Index": index })),
            Err(err) => client_error(err),
        }
    }
}

fn bad_request(message: &str) -> WireResponse {
    WireResponse::error(Status::BadRequest, "BadRequest", message)
}

/// Engine errors as structured error responses.
pub(crate) fn client_error(err: ClientError) -> WireResponse {
    let message = err.to_string();
    match err {
        ClientError::NotLeading { .. } => {
            WireResponse::error(Status::ServiceUnavailable, "NotLeading", &message)
        }
        ClientError::LeadershipLost | ClientError::ShuttingDown | ClientError::Timeout => {
            WireResponse::error(Status::ServiceUnavailable, "Unavailable", &message)
        }
        ClientError::Conflict(_) | ClientError::Topology(TopologyError::ChangeInProgress) => {
            WireResponse::error(Status::Conflict, "Conflict", &message)
        }
        ClientError::BadRequest(_) | ClientError::Topology(_) => bad_request(&message),
        ClientError::Internal(_) => {
            WireResponse::error(Status::InternalServerError, "Internal", &message)
        }
    }
}
