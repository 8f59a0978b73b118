use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::topology::Topology;
use crate::types::{NodeName, TopologyId};

// === 日志条目 ===
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Marks entries whose payload is an encoded [`Topology`].
    pub is_topology_change: bool,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, data: impl Into<Bytes>) -> Self {
        Self {
            index,
            term,
            is_topology_change: false,
            data: data.into(),
        }
    }

    /// Empty entry a new leader appends so earlier-term entries can commit.
    pub fn noop(index: u64, term: u64) -> Self {
        Self::new(index, term, Bytes::new())
    }

    pub fn topology(index: u64, term: u64, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            is_topology_change: true,
            data: Bytes::from(payload),
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.is_topology_change && self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeName>,
}

/// Position covered by the most recent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Topology committed as of `last_included_index`.
    pub topology: Topology,
}

// === 网络消息 ===
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// Pre-vote probe: never changes the receiver's term or vote.
    pub trial_only: bool,
    /// Leadership transfer: skip the pre-vote round and ignore leader stickiness.
    pub forced_election: bool,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Responder's current term.
    pub term: u64,
    /// Term the vote was requested for.
    pub vote_term: u64,
    pub vote_granted: bool,
    pub trial_only: bool,
    pub message: String,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_commit: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success the highest index known to match the leader, otherwise the follower's last index.
    pub last_log_index: u64,
    pub leader_id: Option<NodeName>,
    pub message: String,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanInstallSnapshotRequest {
    pub term: u64,
    pub index: u64,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanInstallSnapshotResponse {
    pub term: u64,
    pub index: u64,
    pub success: bool,
    pub is_currently_installing: bool,
    pub message: String,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

/// Metadata of a streamed snapshot. The body travels separately as framed chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub topology: Topology,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
    pub message: String,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: u64,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedFromCluster {
    pub term: u64,
    /// Index of the topology entry that removed the receiver.
    pub topology_index: u64,
    pub from: NodeName,
    pub cluster_topology_id: TopologyId,
}
