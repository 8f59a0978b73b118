//! Cluster management operations: try locally, forward to the leader when not leading.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::admin::CanJoinResult;
use super::command::{ClusterCommand, ClusterConfiguration};
use crate::engine::RaftEngine;
use crate::error::{ClientError, ClusterError, TopologyError};
use crate::topology::Membership;
use crate::transport::{Body, RequestExecutor, Route, Status, WireRequest, WireResponse};
use crate::types::{NodeConnectionInfo, NodeName};

pub struct ClusterManagementClient {
    engine: RaftEngine,
    executor: RequestExecutor,
    leader_wait: Duration,
}

impl ClusterManagementClient {
    pub fn new(engine: RaftEngine, executor: RequestExecutor) -> Self {
        Self {
            engine,
            executor,
            leader_wait: Duration::from_secs(10),
        }
    }

    /// How long to wait for a leader before giving up on forwarding.
    pub fn with_leader_wait(mut self, wait: Duration) -> Self {
        self.leader_wait = wait;
        self
    }

    /// Adds `node` as a voter.
    pub async fn send_join_server(
        &self,
        node: NodeConnectionInfo,
    ) -> Result<CanJoinResult, ClusterError> {
        match self
            .engine
            .add_to_cluster(node.clone(), Membership::Voter)
            .await
        {
            Ok(()) => return Ok(CanJoinResult::CanJoin),
            Err(ClientError::Topology(TopologyError::AlreadyMember(_))) => {
                return Ok(CanJoinResult::AlreadyJoined);
            }
            Err(ClientError::NotLeading { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let leader = self.leader_node().await?;
        self.send_join_server_internal(&leader, node).await
    }

    pub async fn send_join_server_internal(
        &self,
        leader: &NodeConnectionInfo,
        node: NodeConnectionInfo,
    ) -> Result<CanJoinResult, ClusterError> {
        debug!("Forwarding join of {} to leader {}", node.name, leader.name);
        let response = self.execute(leader, Route::Join, &node).await?;
        CanJoinResult::from_status(response.status).ok_or_else(|| error_from_response(&response))
    }

    /// Asks `node` whether it can join this node's cluster.
    pub async fn send_can_join(
        &self,
        node: &NodeConnectionInfo,
    ) -> Result<CanJoinResult, ClusterError> {
        let route = Route::CanJoin {
            topology_id: self.engine.current_topology().topology_id,
        };
        let response = self
            .executor
            .execute(node, WireRequest::new(route, Body::Empty))
            .await?;
        CanJoinResult::from_status(response.status).ok_or_else(|| error_from_response(&response))
    }

    /// Removes `node`. A leaving leader hands leadership over first.
    pub async fn send_leave(&self, node: &NodeConnectionInfo) -> Result<(), ClusterError> {
        let me = self.engine.name().clone();
        if node.name == me && self.engine.is_leader() {
            info!("Node {} is leaving while leading, stepping down first", me);
            self.engine.step_down().await?;
            self.engine
                .wait_for_status(self.leader_wait, |status| {
                    status.leader.as_ref().is_some_and(|leader| *leader != me)
                })
                .await?;
        } else {
            match self.engine.remove_from_cluster(node.name.clone()).await {
                Ok(()) => return Ok(()),
                Err(ClientError::NotLeading { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let leader = self.leader_node().await?;
        self.send_leave_internal(&leader, node.name.clone()).await
    }

    pub async fn send_leave_internal(
        &self,
        leader: &NodeConnectionInfo,
        name: NodeName,
    ) -> Result<(), ClusterError> {
        debug!("Forwarding removal of {} to leader {}", name, leader.name);
        let response = self
            .executor
            .execute(leader, WireRequest::new(Route::Leave { name }, Body::Empty))
            .await?;
        ensure_success(&response)
    }

    pub async fn send_cluster_configuration(
        &self,
        configuration: ClusterConfiguration,
    ) -> Result<(), ClusterError> {
        let command = ClusterCommand::ClusterConfigurationUpdate {
            configuration: configuration.clone(),
        };
        if self.append_locally(&command).await? {
            return Ok(());
        }
        let leader = self.leader_node().await?;
        let response = self
            .execute(&leader, Route::ClusterConfiguration, &configuration)
            .await?;
        ensure_success(&response)
    }

    pub async fn send_database_update(
        &self,
        name: &str,
        document: serde_json::Value,
    ) -> Result<(), ClusterError> {
        let command = ClusterCommand::DatabaseUpdate {
            name: name.to_string(),
            document: document.clone(),
        };
        if self.append_locally(&command).await? {
            return Ok(());
        }
        let leader = self.leader_node().await?;
        let route = Route::DatabaseUpdate {
            name: name.to_string(),
        };
        let response = self.execute(&leader, route, &document).await?;
        ensure_success(&response)
    }

    pub async fn send_database_delete(
        &self,
        name: &str,
        hard_delete: bool,
    ) -> Result<(), ClusterError> {
        let command = ClusterCommand::DatabaseDeleted {
            name: name.to_string(),
            hard_delete,
        };
        if self.append_locally(&command).await? {
            return Ok(());
        }
        let leader = self.leader_node().await?;
        let route = Route::DatabaseDelete {
            name: name.to_string(),
            hard_delete,
        };
        let response = self
            .executor
            .execute(&leader, WireRequest::new(route, Body::Empty))
            .await?;
        ensure_success(&response)
    }

    /// `Ok(false)` when this node is not leading and the command must be forwarded.
    async fn append_locally(&self, command: &ClusterCommand) -> Result<bool, ClusterError> {
        let data = command
            .encode()
            .map_err(|err| ClusterError::BadRequest(err.to_string()))?;
        match self.engine.append_command(data).await {
            Ok(index) => {
                debug!(
                    "Node {} committed cluster command at {}",
                    self.engine.name(),
                    index
                );
                Ok(true)
            }
            Err(ClientError::NotLeading { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn leader_node(&self) -> Result<NodeConnectionInfo, ClusterError> {
        if let Some(leader) = self.engine.leader_node() {
            return Ok(leader);
        }
        match self.engine.wait_for_leader(self.leader_wait).await {
            Ok(_) => self.engine.leader_node().ok_or(ClusterError::NoLeader),
            Err(ClientError::Timeout) => {
                warn!("Node {} knows no leader to forward to", self.engine.name());
                Err(ClusterError::NoLeader)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn execute<T: Serialize>(
        &self,
        node: &NodeConnectionInfo,
        route: Route,
        body: &T,
    ) -> Result<WireResponse, ClusterError> {
        let body = Body::json(body).map_err(|err| ClusterError::BadRequest(err.to_string()))?;
        Ok(self
            .executor
            .execute(node, WireRequest::new(route, body))
            .await?)
    }
}

fn ensure_success(response: &WireResponse) -> Result<(), ClusterError> {
    if response.status == Status::Ok {
        Ok(())
    } else {
        Err(error_from_response(response))
    }
}

/// Turns a failed administrative response into an error, reading the body when it is structured.
pub fn error_from_response(response: &WireResponse) -> ClusterError {
    let status = response.status.code();
    let text = response.body_text();
    if text.trim().is_empty() {
        return ClusterError::ErrorResponse {
            status,
            message: response.status.to_string(),
        };
    }
    let Ok(serde_json::Value::Object(object)) = serde_json::from_str::<serde_json::Value>(&text)
    else {
        return ClusterError::ErrorResponse {
            status,
            message: text,
        };
    };

    if response.status == Status::BadRequest {
        if let Some(message) = object.get("Message").and_then(|m| m.as_str()) {
            return ClusterError::BadRequest(message.to_string());
        }
    }

    let Some(error) = object.get("Error") else {
        return ClusterError::ErrorResponse {
            status,
            message: text,
        };
    };
    let mut message = String::new();
    for (key, value) in object.iter().filter(|(key, _)| key.as_str() != "Error") {
        let value = serde_json::to_string_pretty(value).unwrap_or_default();
        message.push_str(&format!("{}: {}\n", key, value));
    }
    if !message.is_empty() {
        message.push('\n');
    }
    match error.as_str() {
        Some(error) => message.push_str(error),
        None => message.push_str(&error.to_string()),
    }
    ClusterError::ErrorResponse { status, message }
}
