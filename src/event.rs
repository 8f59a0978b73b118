use std::fmt::{self, Display};

use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::SnapshotStream;
use crate::error::ClientError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, CanInstallSnapshotRequest,
    CanInstallSnapshotResponse, DisconnectedFromCluster, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::topology::TopologyChange;
use crate::types::{NodeName, TimerId};

pub type ClientResult<T> = Result<T, ClientError>;

/// Answer channel of an inbound request. Dropping it unanswered makes the receiving
/// side respond with an error.
pub struct Reply<T>(oneshot::Sender<T>);

impl<T> Reply<T> {
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn send(self, value: T) {
        if self.0.send(value).is_err() {
            debug!("Reply receiver dropped before the answer was sent");
        }
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

/// Application payload paired with its completion signal.
#[derive(Debug)]
pub struct Command {
    pub data: Vec<u8>,
    pub completion: oneshot::Sender<ClientResult<u64>>,
}

/// Outcome of a snapshot installed in the background, fed back into the loop.
#[derive(Debug)]
pub struct SnapshotInstallation {
    pub request: InstallSnapshotRequest,
    pub result: Result<(), String>,
    pub reply: Reply<InstallSnapshotResponse>,
}

/// 消息总线上传递的事件（引擎循环的唯一输入）
#[derive(Debug)]
pub enum Event {
    // Timers carry their id so a replaced timer that already fired is ignored.
    ElectionTimeout(TimerId),
    HeartbeatTimeout(TimerId),
    LeaderTransferTimeout(TimerId),

    // Inbound requests from other nodes.
    RequestVoteRequest(RequestVoteRequest, Reply<RequestVoteResponse>),
    AppendEntriesRequest(AppendEntriesRequest, Reply<AppendEntriesResponse>),
    CanInstallSnapshotRequest(CanInstallSnapshotRequest, Reply<CanInstallSnapshotResponse>),
    InstallSnapshotRequest(
        InstallSnapshotRequest,
        SnapshotBody,
        Reply<InstallSnapshotResponse>,
    ),
    TimeoutNow(TimeoutNowRequest),
    DisconnectedFromCluster(DisconnectedFromCluster),

    // Replies to requests this node sent, re-published by the transport.
    RequestVoteResponse(RequestVoteResponse),
    AppendEntriesResponse(AppendEntriesResponse),
    CanInstallSnapshotResponse(CanInstallSnapshotResponse),
    InstallSnapshotResponse(InstallSnapshotResponse),
    NothingToDo,

    // Local requests.
    ClientPropose(Command),
    ChangeTopology {
        change: TopologyChange,
        completion: oneshot::Sender<ClientResult<()>>,
    },
    StepDown {
        completion: oneshot::Sender<ClientResult<()>>,
    },
    TransferLeadership {
        target: Option<NodeName>,
        completion: oneshot::Sender<ClientResult<()>>,
    },
    CreateSnapshot,
    SnapshotInstalled(SnapshotInstallation),
}

/// Body of an inbound snapshot; taken once by the installing task.
pub struct SnapshotBody(pub SnapshotStream);

impl fmt::Debug for SnapshotBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SnapshotBody")
    }
}

/// Raft 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}
