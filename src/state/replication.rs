//! Log replication handling for Raft state machine

use tracing::{debug, error, info, warn};

use super::{PeerSnapshotState, RaftState};
use crate::event::Role;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, LogEntry};
use crate::topology::Topology;
use crate::types::{NodeConnectionInfo, TimerId};

impl RaftState {
    /// 处理心跳超时
    pub(crate) async fn handle_heartbeat_timeout(&mut self, timer: TimerId) {
        if self.heartbeat_timer != Some(timer) {
            return;
        }
        self.heartbeat_timer = None;

        if self.role != Role::Leader {
            return;
        }

        self.expire_snapshot_states();
        self.broadcast_append_entries().await;

        // Picks up entries whose application failed with a recoverable error.
        self.apply_committed_entries().await;
        self.try_promote_caught_up().await;

        if self.role == Role::Leader {
            self.reset_heartbeat_timer();
        }
    }

    /// 广播 AppendEntries 请求
    pub(crate) async fn broadcast_append_entries(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        for peer in self.replication_peers() {
            self.send_append_entries_to(&peer).await;
        }
    }

    /// Sends the entries `peer` is missing, or starts a snapshot transfer when they were compacted.
    pub(crate) async fn send_append_entries_to(&mut self, peer: &NodeConnectionInfo) {
        match self.snapshot_states.get(&peer.name) {
            Some(PeerSnapshotState::Asking { .. }) => {
                self.send_snapshot_offer(peer);
                return;
            }
            Some(PeerSnapshotState::Installing { index, .. }) => {
                debug!(
                    "Node {} skipping AppendEntries to {}: installing snapshot at {}",
                    self.name, peer.name, index
                );
                return;
            }
            None => {}
        }

        let next_index = *self
            .next_index
            .entry(peer.name.clone())
            .or_insert(self.last_log_index + 1);

        if next_index <= self.last_snapshot_index {
            self.begin_snapshot_transfer(peer);
            return;
        }

        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.term_at(prev_log_index).await else {
            warn!(
                "Node {} has no term for index {} needed by {}",
                self.name, prev_log_index, peer.name
            );
            return;
        };

        let high = (next_index + self.options.max_entries_per_request).min(self.last_log_index + 1);
        let entries = if next_index < high {
            let result = self.storage.get_log_entries(next_index, high).await;
            match self
                .error_handler
                .handle(result, "get_log_entries", Some(&peer.name))
            {
                Some(entries) => entries,
                None => return,
            }
        } else {
            Vec::new()
        };

        if !entries.is_empty() {
            debug!(
                "Node {} sending {} entries to {} (prev_log_index {})",
                self.name,
                entries.len(),
                peer.name,
                prev_log_index
            );
        }

        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_commit: self.commit_index,
            prev_log_index,
            prev_log_term,
            entries,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        };
        self.network.send_append_entries(peer, request);
    }

    fn append_response(&self, success: bool, last_log_index: u64, message: String) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            last_log_index,
            leader_id: self.leader_id.clone(),
            message,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        }
    }

    /// 处理 AppendEntries 请求
    pub(crate) async fn handle_append_entries_request(
        &mut self,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        if !self.accepts_cluster(request.cluster_topology_id) {
            warn!(
                "Node {} rejecting AppendEntries from {} of cluster {}",
                self.name, request.from, request.cluster_topology_id
            );
            return self.append_response(
                false,
                self.last_log_index,
                format!(
                    "This node belongs to cluster {}, not {}",
                    self.cluster_topology_id(),
                    request.cluster_topology_id
                ),
            );
        }

        if request.term < self.current_term {
            return self.append_response(
                false,
                self.last_log_index,
                format!(
                    "Term {} is older than current term {}",
                    request.term, self.current_term
                ),
            );
        }

        self.follow(request.term, &request.from).await;

        if let Some(index) = self.installing_snapshot {
            return self.append_response(
                false,
                self.last_log_index,
                format!("Installing snapshot at index {}", index),
            );
        }

        let prev_log_index = request.prev_log_index;
        if prev_log_index > self.last_log_index {
            debug!(
                "Node {} missing entries before {} (last log index {})",
                self.name, prev_log_index, self.last_log_index
            );
            return self.append_response(
                false,
                self.last_log_index,
                format!("Log ends at {}", self.last_log_index),
            );
        }

        // Anything below the snapshot is committed and therefore matches.
        if prev_log_index >= self.last_snapshot_index {
            let local_term = self.term_at(prev_log_index).await;
            if local_term != Some(request.prev_log_term) {
                debug!(
                    "Node {} term mismatch at {}: local {:?}, leader {}",
                    self.name, prev_log_index, local_term, request.prev_log_term
                );
                return self.append_response(
                    false,
                    prev_log_index.saturating_sub(1).max(self.commit_index),
                    format!("Term mismatch at index {}", prev_log_index),
                );
            }
        }

        let match_index = prev_log_index + request.entries.len() as u64;
        let mut new_entries: Vec<LogEntry> = Vec::new();
        let mut entries = request.entries.into_iter();
        while let Some(entry) = entries.next() {
            if entry.index <= self.last_snapshot_index {
                continue;
            }
            if entry.index <= self.last_log_index {
                if self.term_at(entry.index).await == Some(entry.term) {
                    continue;
                }
                if entry.index <= self.commit_index {
                    error!(
                        "Node {} refusing to overwrite committed entry {} (commit index {})",
                        self.name, entry.index, self.commit_index
                    );
                    return self.append_response(
                        false,
                        self.commit_index,
                        format!("Entry {} is already committed", entry.index),
                    );
                }
                info!(
                    "Node {} truncating conflicting log from index {}",
                    self.name, entry.index
                );
                let result = self.storage.truncate_log_suffix(entry.index).await;
                if !self
                    .error_handler
                    .handle_void(result, "truncate_log_suffix", None)
                {
                    return self.append_response(
                        false,
                        self.last_log_index,
                        "Failed to truncate the log".to_string(),
                    );
                }
                self.refresh_last_log().await;
                if self
                    .pending_topology
                    .as_ref()
                    .is_some_and(|(index, _)| *index >= entry.index)
                {
                    self.pending_topology = None;
                }
            }
            new_entries.push(entry);
            new_entries.extend(entries.by_ref());
        }

        if !new_entries.is_empty() {
            let result = self.storage.append_log_entries(&new_entries).await;
            if !self
                .error_handler
                .handle_void(result, "append_log_entries", None)
            {
                return self.append_response(
                    false,
                    self.last_log_index,
                    "Failed to append entries".to_string(),
                );
            }
            self.refresh_last_log().await;
            self.track_pending_topology(&new_entries);
        }

        if request.leader_commit > self.commit_index {
            let commit = request.leader_commit.min(match_index);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.apply_committed_entries().await;
            }
        }

        self.append_response(true, match_index, String::new())
    }

    /// Remembers the newest topology entry among freshly appended ones.
    fn track_pending_topology(&mut self, entries: &[LogEntry]) {
        let Some(entry) = entries.iter().rev().find(|e| e.is_topology_change) else {
            return;
        };
        match Topology::decode(&entry.data) {
            Ok(topology) => {
                debug!(
                    "Node {} has pending topology at index {}",
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

    /// 处理 AppendEntries 响应
    pub(crate) async fn handle_append_entries_response(&mut self, response: AppendEntriesResponse) {
        if response.term > self.current_term {
            info!(
                "Node {} saw higher term {} from {}",
                self.name, response.term, response.from
            );
            self.step_down_to_follower(Some(response.term)).await;
            return;
        }
        if self.role != Role::Leader || response.term < self.current_term {
            return;
        }
        let Some(peer) = self.peer_info(&response.from) else {
            debug!(
                "Node {} ignoring AppendEntries response from non-member {}",
                self.name, response.from
            );
            return;
        };

        let matched = self.match_index.get(&peer.name).copied().unwrap_or(0);
        if response.success {
            let matched = matched.max(response.last_log_index);
            self.match_index.insert(peer.name.clone(), matched);
            self.next_index.insert(peer.name.clone(), matched + 1);

            self.update_commit_index().await;
            self.try_promote_caught_up().await;
            self.maybe_send_timeout_now(&peer.name).await;

            if self.role == Role::Leader && matched < self.last_log_index {
                self.send_append_entries_to(&peer).await;
            }
        } else {
            let next = self
                .next_index
                .get(&peer.name)
                .copied()
                .unwrap_or(self.last_log_index + 1);
            let backtracked = next
                .saturating_sub(1)
                .min(response.last_log_index + 1)
                .max(matched + 1);
            debug!(
                "Node {} AppendEntries rejected by {} ({}), next index {} -> {}",
                self.name, peer.name, response.message, next, backtracked
            );
            self.next_index.insert(peer.name.clone(), backtracked);
            if backtracked != next {
                self.send_append_entries_to(&peer).await;
            }
        }
    }

    /// Commits the highest index stored on a majority of the committed voters,
    /// provided it belongs to the current term.
    pub(crate) async fn update_commit_index(&mut self) {
        if self.role != Role::Leader || self.topology.voting_nodes.is_empty() {
            return;
        }

        let mut matches: Vec<u64> = self
            .topology
            .voters()
            .map(|voter| {
                if *voter == self.name {
                    self.last_log_index
                } else {
                    self.match_index.get(voter).copied().unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[self.topology.quorum() - 1];

        if candidate <= self.commit_index {
            return;
        }
        if self.term_at(candidate).await != Some(self.current_term) {
            return;
        }

        debug!(
            "Node {} advancing commit index from {} to {}",
            self.name, self.commit_index, candidate
        );
        self.commit_index = candidate;
        self.apply_committed_entries().await;
    }
}
