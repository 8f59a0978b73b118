//! Snapshot handling for Raft state machine

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{PeerSnapshotState, RaftState};
use crate::event::{Event, Reply, Role, SnapshotBody, SnapshotInstallation};
use crate::message::{
    CanInstallSnapshotRequest, CanInstallSnapshotResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, SnapshotMeta,
};
use crate::types::NodeConnectionInfo;

impl RaftState {
    /// Compacts the log once enough applied entries accumulated past the last snapshot.
    pub(crate) async fn maybe_create_snapshot(&mut self) {
        if self.last_applied.saturating_sub(self.last_snapshot_index)
            >= self.options.max_log_length_before_compaction
        {
            self.create_snapshot().await;
        }
    }

    /// 创建快照并截断日志
    pub(crate) async fn create_snapshot(&mut self) {
        if self.installing_snapshot.is_some() {
            debug!("Node {} is installing a snapshot, skipping creation", self.name);
            return;
        }
        let index = self.last_applied;
        if index <= self.last_snapshot_index {
            return;
        }
        let Some(term) = self.term_at(index).await else {
            warn!("Node {} has no term for applied index {}", self.name, index);
            return;
        };

        // Topologies are adopted as their entries apply, so this is the one as of `index`.
        let meta = SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
            topology: self.topology.clone(),
        };
        let result = self.state_machine.create_snapshot(meta.clone()).await;
        if !self
            .error_handler
            .handle_void(result, "create_snapshot", None)
        {
            return;
        }

        let result = self.storage.save_snapshot_meta(meta).await;
        if !self
            .error_handler
            .handle_void(result, "save_snapshot_meta", None)
        {
            return;
        }
        self.last_snapshot_index = index;
        self.last_snapshot_term = term;

        let result = self.storage.truncate_log_prefix(index).await;
        self.error_handler
            .handle_void(result, "truncate_log_prefix", None);

        info!(
            "Node {} created snapshot at index {} term {}",
            self.name, index, term
        );
    }

    /// Asks `peer` whether it can take the current snapshot.
    pub(crate) fn begin_snapshot_transfer(&mut self, peer: &NodeConnectionInfo) {
        if self.snapshot_states.contains_key(&peer.name) {
            return;
        }
        info!(
            "Node {} offering snapshot at index {} to {}",
            self.name, self.last_snapshot_index, peer.name
        );
        self.snapshot_states.insert(
            peer.name.clone(),
            PeerSnapshotState::Asking {
                since: Instant::now(),
            },
        );
        self.send_snapshot_offer(peer);
    }

    /// An unanswered offer is repeated on every replication round; it also keeps the peer's leader alive.
    pub(crate) fn send_snapshot_offer(&self, peer: &NodeConnectionInfo) {
        let request = CanInstallSnapshotRequest {
            term: self.current_term,
            index: self.last_snapshot_index,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        };
        self.network.send_can_install_snapshot(peer, request);
    }

    /// Forgets streamed transfers that made no progress within the install timeout.
    pub(crate) fn expire_snapshot_states(&mut self) {
        let timeout = self.options.snapshot_install_timeout;
        let name = &self.name;
        self.snapshot_states.retain(|peer, state| {
            let PeerSnapshotState::Installing { since, .. } = state else {
                return true;
            };
            let alive = since.elapsed() < timeout;
            if !alive {
                warn!(
                    "Node {} snapshot transfer to {} timed out ({:?})",
                    name, peer, state
                );
            }
            alive
        });
    }

    fn can_install_response(
        &self,
        success: bool,
        index: u64,
        message: String,
    ) -> CanInstallSnapshotResponse {
        CanInstallSnapshotResponse {
            term: self.current_term,
            index,
            success,
            is_currently_installing: self.installing_snapshot.is_some(),
            message,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        }
    }

    /// 处理快照安装询问
    pub(crate) async fn handle_can_install_snapshot(
        &mut self,
        request: CanInstallSnapshotRequest,
    ) -> CanInstallSnapshotResponse {
        if !self.accepts_cluster(request.cluster_topology_id) {
            return self.can_install_response(
                false,
                0,
                format!("This node belongs to cluster {}", self.cluster_topology_id()),
            );
        }
        if request.term < self.current_term {
            return self.can_install_response(
                false,
                0,
                format!(
                    "Term {} is older than current term {}",
                    request.term, self.current_term
                ),
            );
        }

        self.follow(request.term, &request.from).await;

        if let Some(index) = self.installing_snapshot {
            return self.can_install_response(
                false,
                index,
                format!("Already installing snapshot at index {}", index),
            );
        }

        // Committed entries match the leader, so nothing below the commit index needs replacing.
        if request.index <= self.commit_index {
            return self.can_install_response(
                false,
                self.commit_index,
                format!("Already committed up to {}", self.commit_index),
            );
        }

        self.can_install_response(true, request.index, String::new())
    }

    pub(crate) async fn handle_can_install_snapshot_response(
        &mut self,
        response: CanInstallSnapshotResponse,
    ) {
        if response.term > self.current_term {
            self.step_down_to_follower(Some(response.term)).await;
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        let Some(PeerSnapshotState::Asking { since }) = self.snapshot_states.get(&response.from)
        else {
            return;
        };
        debug!(
            "Node {} got snapshot answer from {} after {:?}",
            self.name,
            response.from,
            since.elapsed()
        );
        let Some(peer) = self.peer_info(&response.from) else {
            self.snapshot_states.remove(&response.from);
            return;
        };

        if response.success {
            self.send_snapshot(&peer).await;
            return;
        }

        if response.is_currently_installing {
            debug!(
                "Node {} waiting for {} to finish installing a snapshot",
                self.name, peer.name
            );
            return;
        }

        // Refused without installing: it already holds everything up to `index`.
        self.snapshot_states.remove(&peer.name);
        let matched = self
            .match_index
            .get(&peer.name)
            .copied()
            .unwrap_or(0)
            .max(response.index.min(self.last_log_index));
        self.match_index.insert(peer.name.clone(), matched);
        self.next_index.insert(peer.name.clone(), response.index + 1);
        debug!(
            "Node {} resuming replication to {} from index {}",
            self.name,
            peer.name,
            response.index + 1
        );
        self.send_append_entries_to(&peer).await;
    }

    async fn send_snapshot(&mut self, peer: &NodeConnectionInfo) {
        let result = self.state_machine.read_snapshot().await;
        let reader = match self.error_handler.handle(result, "read_snapshot", Some(&peer.name)) {
            Some(Some(reader)) => reader,
            Some(None) | None => {
                warn!("Node {} has no snapshot to send to {}", self.name, peer.name);
                self.snapshot_states.remove(&peer.name);
                return;
            }
        };

        let index = reader.meta.last_included_index;
        info!(
            "Node {} streaming snapshot at index {} to {}",
            self.name, index, peer.name
        );
        self.snapshot_states.insert(
            peer.name.clone(),
            PeerSnapshotState::Installing {
                index,
                since: Instant::now(),
            },
        );
        let request = InstallSnapshotRequest {
            term: self.current_term,
            last_included_index: index,
            last_included_term: reader.meta.last_included_term,
            topology: reader.meta.topology,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        };
        self.network.send_install_snapshot(peer, request, reader.body);
    }

    fn install_response(&self, success: bool, last_log_index: u64, message: String) -> InstallSnapshotResponse {
        InstallSnapshotResponse {
            term: self.current_term,
            success,
            last_log_index,
            message,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        }
    }

    /// 处理快照安装请求
    ///
    /// The body is consumed by a background task; the result comes back as
    /// [`Event::SnapshotInstalled`] and is answered from there.
    pub(crate) async fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
        body: SnapshotBody,
        reply: Reply<InstallSnapshotResponse>,
    ) {
        if !self.accepts_cluster(request.cluster_topology_id) {
            let message = format!("This node belongs to cluster {}", self.cluster_topology_id());
            reply.send(self.install_response(false, self.last_log_index, message));
            return;
        }
        if request.term < self.current_term {
            let message = format!(
                "Term {} is older than current term {}",
                request.term, self.current_term
            );
            reply.send(self.install_response(false, self.last_log_index, message));
            return;
        }

        self.follow(request.term, &request.from).await;

        if let Some(index) = self.installing_snapshot {
            let message = format!("Already installing snapshot at index {}", index);
            reply.send(self.install_response(false, self.last_log_index, message));
            return;
        }
        if request.last_included_index <= self.commit_index {
            reply.send(self.install_response(
                true,
                self.commit_index,
                "Snapshot is older than the commit index".to_string(),
            ));
            return;
        }

        info!(
            "Node {} installing snapshot at index {} from {}",
            self.name, request.last_included_index, request.from
        );
        self.installing_snapshot = Some(request.last_included_index);

        let meta = SnapshotMeta {
            last_included_index: request.last_included_index,
            last_included_term: request.last_included_term,
            topology: request.topology.clone(),
        };
        let state_machine = self.state_machine.clone();
        let bus = self.bus.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let result = state_machine
                .install_snapshot(meta, body.0)
                .await
                .map_err(|err| err.to_string());
            if let Err(err) = &result {
                error!("Node {} failed to install snapshot: {}", name, err);
            }
            bus.publish(Event::SnapshotInstalled(SnapshotInstallation {
                request,
                result,
                reply,
            }));
        });
    }

    /// Finishes a background installation: rebases the log on the snapshot and adopts the
    /// topology committed as of the snapshot index.
    pub(crate) async fn handle_snapshot_installed(&mut self, installation: SnapshotInstallation) {
        let SnapshotInstallation {
            request,
            result,
            reply,
        } = installation;
        self.installing_snapshot = None;

        if let Err(err) = result {
            reply.send(self.install_response(false, self.last_log_index, err));
            return;
        }

        let index = request.last_included_index;
        let term = request.last_included_term;

        let keeps_suffix =
            index <= self.last_log_index && self.term_at(index).await == Some(term);
        if !keeps_suffix {
            let result = self.storage.truncate_log_suffix(0).await;
            if !self
                .error_handler
                .handle_void(result, "truncate_log_suffix", None)
            {
                reply.send(self.install_response(false, self.last_log_index, "Failed to clear the log".into()));
                return;
            }
        }
        let result = self.storage.truncate_log_prefix(index).await;
        self.error_handler
            .handle_void(result, "truncate_log_prefix", None);

        let meta = SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
            topology: request.topology.clone(),
        };
        let result = self.storage.save_snapshot_meta(meta).await;
        if !self
            .error_handler
            .handle_void(result, "save_snapshot_meta", None)
        {
            reply.send(self.install_response(false, self.last_log_index, "Failed to save snapshot meta".into()));
            return;
        }

        self.last_snapshot_index = index;
        self.last_snapshot_term = term;
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
        self.refresh_last_log().await;

        if self
            .pending_topology
            .as_ref()
            .is_some_and(|(pending, _)| *pending <= index || !keeps_suffix)
        {
            self.pending_topology = None;
        }
        self.topology = request.topology;
        self.persist_topology().await;

        info!(
            "Node {} installed snapshot at index {} term {} (log now ends at {})",
            self.name, index, term, self.last_log_index
        );
        reply.send(self.install_response(true, index, String::new()));

        self.apply_committed_entries().await;
    }

    pub(crate) async fn handle_install_snapshot_response(
        &mut self,
        response: InstallSnapshotResponse,
    ) {
        if response.term > self.current_term {
            self.step_down_to_follower(Some(response.term)).await;
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        if !matches!(
            self.snapshot_states.remove(&response.from),
            Some(PeerSnapshotState::Installing { .. })
        ) {
            return;
        }
        let Some(peer) = self.peer_info(&response.from) else {
            return;
        };

        if !response.success {
            warn!(
                "Node {} snapshot install on {} failed: {}",
                self.name, peer.name, response.message
            );
            return;
        }

        let matched = self
            .match_index
            .get(&peer.name)
            .copied()
            .unwrap_or(0)
            .max(response.last_log_index);
        self.match_index.insert(peer.name.clone(), matched);
        self.next_index.insert(peer.name.clone(), matched + 1);
        info!(
            "Node {} finished snapshot transfer to {} at index {}",
            self.name, peer.name, matched
        );

        self.update_commit_index().await;
        self.send_append_entries_to(&peer).await;
    }
}
