//! Leader transfer handling for Raft state machine

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{LeaderTransfer, RaftState};
use crate::error::ClientError;
use crate::event::{ClientResult, Role};
use crate::message::TimeoutNowRequest;
use crate::types::{NodeName, TimerId};

impl RaftState {
    /// Hands leadership to the most up-to-date voter.
    pub(crate) async fn handle_step_down(&mut self, completion: oneshot::Sender<ClientResult<()>>) {
        self.handle_transfer_leadership(None, completion).await;
    }

    /// 处理领导权转移请求
    pub(crate) async fn handle_transfer_leadership(
        &mut self,
        target: Option<NodeName>,
        completion: oneshot::Sender<ClientResult<()>>,
    ) {
        if self.role != Role::Leader {
            let _ = completion.send(Err(ClientError::NotLeading {
                leader: self.leader_id.clone(),
            }));
            return;
        }
        if let Some(transfer) = &self.leader_transfer {
            let _ = completion.send(Err(ClientError::Conflict(format!(
                "Leadership transfer to {} already in progress",
                transfer.target
            ))));
            return;
        }

        let target = match target {
            Some(target) if target == self.name => {
                let _ = completion.send(Err(ClientError::BadRequest(
                    "Cannot transfer leadership to self".to_string(),
                )));
                return;
            }
            Some(target) if !self.topology.is_voter(&target) => {
                let _ = completion.send(Err(ClientError::BadRequest(format!(
                    "{} is not a voting member",
                    target
                ))));
                return;
            }
            Some(target) => target,
            None => match self.best_transfer_target() {
                Some(target) => target,
                None => {
                    let _ = completion.send(Err(ClientError::BadRequest(
                        "No other voting member to hand leadership to".to_string(),
                    )));
                    return;
                }
            },
        };

        info!(
            "Node {} transferring leadership to {} in term {}",
            self.name, target, self.current_term
        );
        let timer = self
            .timers
            .set_leader_transfer_timer(self.options.leader_transfer_timeout);
        self.leader_transfer = Some(LeaderTransfer {
            target: target.clone(),
            completion,
            timer,
        });
        self.maybe_send_timeout_now(&target).await;
    }

    /// Voter other than self with the highest replicated index.
    fn best_transfer_target(&self) -> Option<NodeName> {
        self.topology
            .voters()
            .filter(|voter| **voter != self.name)
            .max_by_key(|voter| self.match_index.get(*voter).copied().unwrap_or(0))
            .cloned()
    }

    /// Sends TimeoutNow once the transfer target holds the whole log, then steps down.
    pub(crate) async fn maybe_send_timeout_now(&mut self, name: &NodeName) {
        if self.role != Role::Leader {
            return;
        }
        let Some(transfer) = &self.leader_transfer else {
            return;
        };
        if transfer.target != *name {
            return;
        }
        let Some(peer) = self.peer_info(name) else {
            return;
        };

        let matched = self.match_index.get(name).copied().unwrap_or(0);
        if matched < self.last_log_index {
            debug!(
                "Node {} waiting for {} to catch up ({} < {}) before TimeoutNow",
                self.name, name, matched, self.last_log_index
            );
            self.send_append_entries_to(&peer).await;
            return;
        }

        info!("Node {} sending TimeoutNow to {}", self.name, name);
        self.network.send_timeout_now(
            &peer,
            TimeoutNowRequest {
                term: self.current_term,
                from: self.name.clone(),
                cluster_topology_id: self.cluster_topology_id(),
            },
        );
        // Resolves the transfer completion.
        self.step_down_to_follower(None).await;
    }

    pub(crate) fn handle_leader_transfer_timeout(&mut self, timer: TimerId) {
        if self.leader_transfer.as_ref().map(|t| t.timer) != Some(timer) {
            return;
        }
        if let Some(transfer) = self.leader_transfer.take() {
            warn!(
                "Node {} leadership transfer to {} timed out",
                self.name, transfer.target
            );
            let _ = transfer.completion.send(Err(ClientError::Timeout));
        }
    }

    /// 处理 TimeoutNow：立即发起强制选举
    pub(crate) async fn handle_timeout_now(&mut self, request: TimeoutNowRequest) {
        if request.term < self.current_term
            || !self.accepts_cluster(request.cluster_topology_id)
            || !self.topology.is_voter(&self.name)
        {
            debug!(
                "Node {} ignoring TimeoutNow from {} in term {}",
                self.name, request.from, request.term
            );
            return;
        }
        info!(
            "Node {} received TimeoutNow from {}, starting forced election",
            self.name, request.from
        );
        self.update_term(request.term).await;
        self.start_election(true).await;
    }
}
