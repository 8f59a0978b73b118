use std::time::Duration;

use async_trait::async_trait;

use crate::codec::SnapshotStream;
use crate::error::{ApplyError, SnapshotError, StorageError};
use crate::message::{
    AppendEntriesRequest, CanInstallSnapshotRequest, DisconnectedFromCluster, HardState,
    InstallSnapshotRequest, LogEntry, RequestVoteRequest, SnapshotMeta, TimeoutNowRequest,
};
use crate::topology::Topology;
use crate::types::{NodeConnectionInfo, TimerId};

// 结果类型别名
pub type StorageResult<T> = Result<T, StorageError>;
pub type ApplyResult<T> = Result<T, ApplyError>;
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Outbound side of the consensus protocol.
///
/// Every method is fire-and-forget: it returns immediately and the reply, if any,
/// comes back through the message bus.
pub trait Network: Send + Sync {
    fn send_request_vote(&self, dest: &NodeConnectionInfo, req: RequestVoteRequest);

    fn send_append_entries(&self, dest: &NodeConnectionInfo, req: AppendEntriesRequest);

    fn send_can_install_snapshot(&self, dest: &NodeConnectionInfo, req: CanInstallSnapshotRequest);

    fn send_install_snapshot(
        &self,
        dest: &NodeConnectionInfo,
        req: InstallSnapshotRequest,
        body: SnapshotStream,
    );

    fn send_timeout_now(&self, dest: &NodeConnectionInfo, req: TimeoutNowRequest);

    fn send_disconnected_from_cluster(
        &self,
        dest: &NodeConnectionInfo,
        req: DisconnectedFromCluster,
    );
}

#[async_trait]
pub trait HardStateStorage: Send + Sync {
    async fn save_hard_state(&self, hard_state: HardState) -> StorageResult<()>;
    async fn load_hard_state(&self) -> StorageResult<Option<HardState>>;
}

/// Log primitives. Indices start at 1; index 0 is the empty prefix with term 0.
#[async_trait]
pub trait LogEntryStorage: Send + Sync {
    async fn append_log_entries(&self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Entries in `[low, high)`.
    async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>>;

    /// Removes every entry from `idx` onwards.
    async fn truncate_log_suffix(&self, idx: u64) -> StorageResult<()>;

    /// Removes every entry up to and including `idx`.
    async fn truncate_log_prefix(&self, idx: u64) -> StorageResult<()>;

    /// Index and term of the last stored entry, `(0, 0)` when the log is empty.
    async fn get_last_log_index(&self) -> StorageResult<(u64, u64)>;

    async fn get_log_term(&self, idx: u64) -> StorageResult<u64>;
}

#[async_trait]
pub trait SnapshotMetaStorage: Send + Sync {
    async fn save_snapshot_meta(&self, meta: SnapshotMeta) -> StorageResult<()>;
    async fn load_snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>>;
}

/// Holds the committed topology.
#[async_trait]
pub trait TopologyStorage: Send + Sync {
    async fn save_topology(&self, topology: &Topology) -> StorageResult<()>;
    async fn load_topology(&self) -> StorageResult<Option<Topology>>;
}

pub trait Storage:
    HardStateStorage + LogEntryStorage + SnapshotMetaStorage + TopologyStorage + Send + Sync
{
}

/// Snapshot read from the state machine for transfer to a peer.
pub struct SnapshotReader {
    pub meta: SnapshotMeta,
    pub body: SnapshotStream,
}

/// Application state machine driven by committed entries.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Highest index reflected in the state machine, used to skip replay after restart.
    fn last_applied_index(&self) -> u64;

    async fn apply(&self, index: u64, term: u64, data: &[u8]) -> ApplyResult<()>;

    /// Captures the state as of `meta.last_included_index`, which is the last applied entry.
    async fn create_snapshot(&self, meta: SnapshotMeta) -> SnapshotResult<()>;

    async fn read_snapshot(&self) -> SnapshotResult<Option<SnapshotReader>>;

    /// Replaces the whole state with the streamed snapshot.
    async fn install_snapshot(&self, meta: SnapshotMeta, body: SnapshotStream)
    -> SnapshotResult<()>;
}

pub trait TimerService: Send + Sync {
    fn del_timer(&self, timer_id: TimerId);
    fn set_election_timer(&self, dur: Duration) -> TimerId;
    fn set_heartbeat_timer(&self, dur: Duration) -> TimerId;
    fn set_leader_transfer_timer(&self, dur: Duration) -> TimerId;
}
