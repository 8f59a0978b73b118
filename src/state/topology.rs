//! Topology change handling for Raft state machine
//!
//! One change at a time: a proposed topology is replicated as a log entry to the
//! union of old and new members, and becomes the committed topology when applied.

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::RaftState;
use crate::error::{ClientError, TopologyError};
use crate::event::{ClientResult, Role};
use crate::message::{DisconnectedFromCluster, LogEntry};
use crate::topology::{Membership, Topology, TopologyChange};
use crate::types::{NodeName, TopologyId};

impl RaftState {
    /// Finds the newest uncommitted topology entry left in the log after a restart.
    pub(crate) async fn recover_pending_topology(&mut self) {
        if self.last_log_index <= self.last_applied {
            return;
        }
        let result = self
            .storage
            .get_log_entries(self.last_applied + 1, self.last_log_index + 1)
            .await;
        let Some(entries) = self
            .error_handler
            .handle(result, "get_log_entries", None)
        else {
            return;
        };
        if let Some(entry) = entries.iter().rev().find(|e| e.is_topology_change) {
            match Topology::decode(&entry.data) {
                Ok(topology) => {
                    info!(
                        "Node {} recovered pending topology at index {}",
                        self.name, entry.index
                    );
                    self.pending_topology = Some((entry.index, topology));
                }
                Err(err) => {
                    self.error_handler
                        .handle_void(Err(err), "decode_topology", None);
                }
            }
        }
    }

    /// 处理拓扑变更请求
    pub(crate) async fn handle_change_topology(
        &mut self,
        change: TopologyChange,
        completion: oneshot::Sender<ClientResult<()>>,
    ) {
        if self.role != Role::Leader {
            let _ = completion.send(Err(ClientError::NotLeading {
                leader: self.leader_id.clone(),
            }));
            return;
        }
        if self.pending_topology.is_some() || self.pending_topology_change.is_some() {
            let _ = completion.send(Err(TopologyError::ChangeInProgress.into()));
            return;
        }
        if matches!(&change, TopologyChange::Remove { name } if *name == self.name) {
            let _ = completion.send(Err(TopologyError::RemovingLeader.into()));
            return;
        }

        // Voters join through the promotable set and are promoted once caught up.
        let change = match change {
            TopologyChange::Add {
                node,
                membership: Membership::Voter,
            } => match self.topology.membership(&node.name) {
                Some(Membership::Voter) => TopologyChange::Add {
                    node,
                    membership: Membership::Voter,
                },
                _ => TopologyChange::Add {
                    node,
                    membership: Membership::Promotable,
                },
            },
            other => other,
        };

        let next = match self.topology.apply_change(&change) {
            Ok(next) => next,
            Err(err) => {
                debug!("Node {} rejecting {:?}: {}", self.name, change, err);
                let _ = completion.send(Err(err.into()));
                return;
            }
        };

        info!("Node {} proposing topology change {:?}", self.name, change);
        match self.propose_topology(next).await {
            Some(index) => self.pending_topology_change = Some((index, completion)),
            None => {
                let _ = completion.send(Err(ClientError::Internal(
                    "Failed to append topology entry".to_string(),
                )));
                return;
            }
        }

        self.broadcast_append_entries().await;
        self.update_commit_index().await;
    }

    /// Appends `next` as a topology entry and starts replicating to its members.
    async fn propose_topology(&mut self, mut next: Topology) -> Option<u64> {
        next.index = self.last_log_index + 1;
        let payload = match next.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Node {} failed to encode topology: {}", self.name, err);
                return None;
            }
        };
        let entry = LogEntry::topology(self.last_log_index + 1, self.current_term, payload);
        let index = entry.index;
        if !self.append_local(entry).await {
            return None;
        }
        for node in next.all_nodes() {
            if node.name != self.name && !self.next_index.contains_key(&node.name) {
                self.next_index
                    .insert(node.name.clone(), self.last_log_index);
                self.match_index.insert(node.name.clone(), 0);
            }
        }
        self.pending_topology = Some((index, next));
        Some(index)
    }

    /// Adopts a topology whose entry was just applied.
    pub(crate) async fn commit_topology(&mut self, index: u64, topology: Topology) {
        let previous = std::mem::replace(&mut self.topology, topology);
        self.persist_topology().await;
        if self
            .pending_topology
            .as_ref()
            .is_some_and(|(pending, _)| *pending <= index)
        {
            self.pending_topology = None;
        }
        info!(
            "Node {} committed topology at index {}: voters {:?}, non-voters {:?}, promotable {:?}",
            self.name,
            index,
            self.topology.voting_nodes.keys().collect::<Vec<_>>(),
            self.topology.non_voting_nodes.keys().collect::<Vec<_>>(),
            self.topology.promotable_nodes.keys().collect::<Vec<_>>()
        );

        if self.role != Role::Leader {
            return;
        }

        let removed: Vec<_> = previous
            .all_nodes()
            .filter(|node| !self.topology.contains(&node.name) && node.name != self.name)
            .cloned()
            .collect();
        for node in removed {
            info!(
                "Node {} notifying {} that it left the cluster",
                self.name, node.name
            );
            self.network.send_disconnected_from_cluster(
                &node,
                DisconnectedFromCluster {
                    term: self.current_term,
                    topology_index: index,
                    from: self.name.clone(),
                    cluster_topology_id: self.cluster_topology_id(),
                },
            );
            self.next_index.remove(&node.name);
            self.match_index.remove(&node.name);
            self.snapshot_states.remove(&node.name);
        }

        for peer in self.replication_peers() {
            if !self.next_index.contains_key(&peer.name) {
                self.next_index
                    .insert(peer.name.clone(), self.last_log_index + 1);
                self.match_index.insert(peer.name, 0);
            }
        }
    }

    /// Promotes one promotable node whose log reached the commit index.
    pub(crate) async fn try_promote_caught_up(&mut self) {
        if self.role != Role::Leader
            || self.pending_topology.is_some()
            || self.pending_topology_change.is_some()
        {
            return;
        }
        let caught_up: Option<NodeName> = self
            .topology
            .promotable_nodes
            .keys()
            .find(|name| {
                self.match_index
                    .get(*name)
                    .is_some_and(|matched| *matched >= self.commit_index)
            })
            .cloned();
        let Some(name) = caught_up else {
            return;
        };

        let change = TopologyChange::Promote { name: name.clone() };
        let next = match self.topology.apply_change(&change) {
            Ok(next) => next,
            Err(err) => {
                warn!("Node {} cannot promote {}: {}", self.name, name, err);
                return;
            }
        };
        info!("Node {} promoting {} to voter", self.name, name);
        if self.propose_topology(next).await.is_some() {
            self.broadcast_append_entries().await;
            self.update_commit_index().await;
        }
    }

    /// 处理被移出集群的通知
    pub(crate) async fn handle_disconnected_from_cluster(&mut self, request: DisconnectedFromCluster) {
        if request.term < self.current_term
            || !self.accepts_cluster(request.cluster_topology_id)
            || self.topology.is_empty()
        {
            debug!(
                "Node {} ignoring disconnect notice from {} (term {})",
                self.name, request.from, request.term
            );
            return;
        }
        // Added back by a later change than the one this notice is about.
        let latest = self
            .pending_topology
            .as_ref()
            .map_or(self.topology.index, |(index, _)| (*index).max(self.topology.index));
        if latest > request.topology_index {
            info!(
                "Node {} ignoring stale disconnect notice from {}: removed at {}, topology now at {}",
                self.name, request.from, request.topology_index, latest
            );
            return;
        }

        warn!(
            "Node {} was removed from cluster {} by {}",
            self.name, request.cluster_topology_id, request.from
        );
        self.step_down_to_follower(Some(request.term)).await;
        self.leader_id = None;
        self.pending_topology = None;
        self.topology = Topology::new(TopologyId::new());
        self.persist_topology().await;
    }
}
