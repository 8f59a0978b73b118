//! Raft State Machine Module
//!
//! The `RaftState` struct is owned by the engine loop and mutated only there.
//! Its behaviour is split across files:
//!
//! - `mod.rs` - State struct, options and event dispatch
//! - `election.rs` - Pre-vote, election and vote handling
//! - `replication.rs` - AppendEntries on both sides and commit advancement
//! - `client.rs` - Command proposals and applying committed entries
//! - `snapshot.rs` - Snapshot creation, transfer and installation
//! - `topology.rs` - Membership changes and removal notification
//! - `leader_transfer.rs` - Step down and TimeoutNow

mod client;
mod election;
mod leader_transfer;
mod replication;
mod snapshot;
mod topology;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::error::{CallbackErrorHandler, ClientError, RaftError};
use crate::event::{ClientResult, Event, Role};
use crate::message::HardState;
use crate::topology::Topology;
use crate::traits::{Network, StateMachine, Storage, TimerService};
use crate::types::{NodeConnectionInfo, NodeName, TimerId, TopologyId};

/// Raft 状态机配置选项
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound of entries carried by one AppendEntries request.
    pub max_entries_per_request: u64,
    /// 每次应用到状态机的日志条数
    pub apply_batch_size: u64,
    /// Applied entries kept in the log before a snapshot compacts them.
    pub max_log_length_before_compaction: u64,
    /// Run a non-binding trial round before incrementing the term.
    pub pre_vote_enabled: bool,
    pub leader_transfer_timeout: Duration,
    /// A peer stuck in snapshot transfer longer than this is offered a new one.
    pub snapshot_install_timeout: Duration,
    /// Topology persisted on first start when storage holds none.
    pub initial_topology: Option<Topology>,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_request: 64,
            apply_batch_size: 64,
            max_log_length_before_compaction: 32 * 1024,
            pre_vote_enabled: true,
            leader_transfer_timeout: Duration::from_secs(10),
            snapshot_install_timeout: Duration::from_secs(60),
            initial_topology: None,
        }
    }
}

/// Snapshot of the engine published after every processed event.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub name: NodeName,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeName>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub topology: Arc<Topology>,
    pub stopped: bool,
}

impl EngineStatus {
    pub fn initial(name: NodeName) -> Self {
        Self {
            name,
            role: Role::Follower,
            term: 0,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            topology: Arc::new(Topology::new(TopologyId::new())),
            stopped: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// Votes gathered by a candidate for one round.
#[derive(Debug)]
pub(crate) struct Election {
    /// Term the votes are requested for.
    pub term: u64,
    pub trial: bool,
    pub forced: bool,
    pub votes: HashSet<NodeName>,
}

/// Leader-side progress of a snapshot transfer to one peer.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PeerSnapshotState {
    Asking { since: Instant },
    Installing { index: u64, since: Instant },
}

#[derive(Debug)]
pub(crate) struct LeaderTransfer {
    pub target: NodeName,
    pub completion: oneshot::Sender<ClientResult<()>>,
    pub timer: TimerId,
}

/// Raft 状态机（可变状态，无 Clone）
pub struct RaftState {
    // 节点标识
    pub name: NodeName,
    pub self_info: NodeConnectionInfo,
    pub leader_id: Option<NodeName>,

    // 核心状态
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<NodeName>,

    /// Last committed topology. Quorum is always computed against it.
    pub topology: Topology,
    /// Uncommitted topology entry present in the log, if any.
    pub pending_topology: Option<(u64, Topology)>,

    // 日志与提交状态
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_snapshot_index: u64,
    pub last_snapshot_term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,

    // Leader 专用状态
    pub next_index: HashMap<NodeName, u64>,
    pub match_index: HashMap<NodeName, u64>,
    pub(crate) snapshot_states: HashMap<NodeName, PeerSnapshotState>,
    pub(crate) pending_commands: BTreeMap<u64, oneshot::Sender<ClientResult<u64>>>,
    pub(crate) pending_topology_change: Option<(u64, oneshot::Sender<ClientResult<()>>)>,
    pub(crate) leader_transfer: Option<LeaderTransfer>,

    // 选举状态
    pub(crate) election: Option<Election>,
    pub(crate) election_timer: Option<TimerId>,
    pub(crate) heartbeat_timer: Option<TimerId>,
    pub last_heartbeat: Instant,

    // Follower 快照安装状态
    pub(crate) installing_snapshot: Option<u64>,

    // 外部依赖
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) timers: Arc<dyn TimerService>,
    pub(crate) bus: MessageBus,
    status: watch::Sender<EngineStatus>,

    pub error_handler: CallbackErrorHandler,
    pub options: RaftOptions,
}

/// Collaborators handed to [`RaftState::new`].
pub struct RaftStateDeps {
    pub storage: Arc<dyn Storage>,
    pub state_machine: Arc<dyn StateMachine>,
    pub network: Arc<dyn Network>,
    pub timers: Arc<dyn TimerService>,
    pub bus: MessageBus,
    pub status: watch::Sender<EngineStatus>,
}

impl RaftState {
    /// 初始化状态
    pub async fn new(
        options: RaftOptions,
        self_info: NodeConnectionInfo,
        deps: RaftStateDeps,
    ) -> Result<Self> {
        let storage = deps.storage;
        let name = self_info.name.clone();

        let hard_state = storage.load_hard_state().await.map_err(|err| {
            error!("Node {} failed to load hard state: {}", name, err);
            RaftError::Storage(err)
        })?;
        let (current_term, voted_for) = hard_state
            .map(|hs| (hs.term, hs.voted_for))
            .unwrap_or((0, None));

        let topology = match storage.load_topology().await.map_err(RaftError::Storage)? {
            Some(topology) => topology,
            None => {
                let topology = options
                    .initial_topology
                    .clone()
                    .unwrap_or_else(|| Topology::new(TopologyId::new()));
                storage
                    .save_topology(&topology)
                    .await
                    .map_err(RaftError::Storage)?;
                topology
            }
        };

        let (snapshot_index, snapshot_term) = storage
            .load_snapshot_meta()
            .await
            .map_err(RaftError::Storage)?
            .map_or((0, 0), |meta| (meta.last_included_index, meta.last_included_term));

        let (stored_index, stored_term) = storage
            .get_last_log_index()
            .await
            .map_err(RaftError::Storage)?;
        let (last_log_index, last_log_term) = if stored_index < snapshot_index {
            (snapshot_index, snapshot_term)
        } else {
            (stored_index, stored_term)
        };

        let applied = deps
            .state_machine
            .last_applied_index()
            .max(snapshot_index)
            .min(last_log_index);

        info!(
            "Node {} loaded term {} log ({}, {}) snapshot {} applied {}",
            name,
            current_term,
            last_log_index,
            last_log_term,
            snapshot_index,
            applied
        );

        let mut state = RaftState {
            error_handler: CallbackErrorHandler::new(name.clone()),
            name,
            self_info,
            leader_id: None,
            role: Role::Follower,
            current_term,
            voted_for,
            topology,
            pending_topology: None,
            commit_index: applied,
            last_applied: applied,
            last_snapshot_index: snapshot_index,
            last_snapshot_term: snapshot_term,
            last_log_index,
            last_log_term,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            snapshot_states: HashMap::new(),
            pending_commands: BTreeMap::new(),
            pending_topology_change: None,
            leader_transfer: None,
            election: None,
            election_timer: None,
            heartbeat_timer: None,
            last_heartbeat: Instant::now(),
            installing_snapshot: None,
            storage,
            state_machine: deps.state_machine,
            network: deps.network,
            timers: deps.timers,
            bus: deps.bus,
            status: deps.status,
            options,
        };
        state.recover_pending_topology().await;
        Ok(state)
    }

    /// Arms the election timer and publishes the initial status.
    pub fn start(&mut self) {
        self.reset_election_timer();
        self.publish_status();
    }

    /// 处理事件（主入口）
    pub async fn handle_event(&mut self, event: Event) {
        if self.is_stopped() {
            warn!("Node {} is stopped, dropping {:?}", self.name, event);
            return;
        }

        match event {
            Event::ElectionTimeout(timer) => self.handle_election_timeout(timer).await,
            Event::HeartbeatTimeout(timer) => self.handle_heartbeat_timeout(timer).await,
            Event::LeaderTransferTimeout(timer) => self.handle_leader_transfer_timeout(timer),
            Event::RequestVoteRequest(request, reply) => {
                let response = self.handle_request_vote(request).await;
                reply.send(response);
            }
            Event::AppendEntriesRequest(request, reply) => {
                let response = self.handle_append_entries_request(request).await;
                reply.send(response);
            }
            Event::CanInstallSnapshotRequest(request, reply) => {
                let response = self.handle_can_install_snapshot(request).await;
                reply.send(response);
            }
            Event::InstallSnapshotRequest(request, body, reply) => {
                self.handle_install_snapshot(request, body, reply).await
            }
            Event::TimeoutNow(request) => self.handle_timeout_now(request).await,
            Event::DisconnectedFromCluster(request) => {
                self.handle_disconnected_from_cluster(request).await
            }
            Event::RequestVoteResponse(response) => {
                self.handle_request_vote_response(response).await
            }
            Event::AppendEntriesResponse(response) => {
                self.handle_append_entries_response(response).await
            }
            Event::CanInstallSnapshotResponse(response) => {
                self.handle_can_install_snapshot_response(response).await
            }
            Event::InstallSnapshotResponse(response) => {
                self.handle_install_snapshot_response(response).await
            }
            Event::NothingToDo => {}
            Event::ClientPropose(command) => self.handle_client_propose(command).await,
            Event::ChangeTopology { change, completion } => {
                self.handle_change_topology(change, completion).await
            }
            Event::StepDown { completion } => self.handle_step_down(completion).await,
            Event::TransferLeadership { target, completion } => {
                self.handle_transfer_leadership(target, completion).await
            }
            Event::CreateSnapshot => self.create_snapshot().await,
            Event::SnapshotInstalled(installation) => {
                self.handle_snapshot_installed(installation).await
            }
        }

        self.publish_status();
    }

    pub fn get_role(&self) -> Role {
        self.role
    }

    pub fn get_current_term(&self) -> u64 {
        self.current_term
    }

    pub fn get_commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn is_stopped(&self) -> bool {
        self.error_handler.is_stopped()
    }

    /// A node with an empty topology is not part of any cluster and accepts the first one
    /// that replicates to it.
    pub(crate) fn accepts_cluster(&self, topology_id: TopologyId) -> bool {
        self.topology.is_empty() || self.topology.topology_id == topology_id
    }

    pub(crate) fn cluster_topology_id(&self) -> TopologyId {
        self.topology.topology_id
    }

    /// Connection info of a member of the committed or the pending topology.
    pub(crate) fn peer_info(&self, name: &str) -> Option<NodeConnectionInfo> {
        self.topology
            .get_node(name)
            .or_else(|| {
                self.pending_topology
                    .as_ref()
                    .and_then(|(_, topology)| topology.get_node(name))
            })
            .cloned()
    }

    /// Every node that should receive the log: members of the committed and pending topology.
    pub(crate) fn replication_peers(&self) -> Vec<NodeConnectionInfo> {
        let mut peers: BTreeMap<&NodeName, &NodeConnectionInfo> = BTreeMap::new();
        for node in self.topology.all_nodes() {
            peers.insert(&node.name, node);
        }
        if let Some((_, pending)) = &self.pending_topology {
            for node in pending.all_nodes() {
                peers.insert(&node.name, node);
            }
        }
        peers
            .into_iter()
            .filter(|(name, _)| **name != self.name)
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Term of the entry at `idx`, resolving the snapshot boundary. `None` when unknown.
    pub(crate) async fn term_at(&mut self, idx: u64) -> Option<u64> {
        if idx == 0 {
            return Some(0);
        }
        if idx == self.last_snapshot_index {
            return Some(self.last_snapshot_term);
        }
        if idx < self.last_snapshot_index || idx > self.last_log_index {
            return None;
        }
        let result = self.storage.get_log_term(idx).await;
        self.error_handler.handle(result, "get_log_term", None)
    }

    /// Re-reads the log tail after appends or truncation.
    pub(crate) async fn refresh_last_log(&mut self) {
        let result = self.storage.get_last_log_index().await;
        if let Some((index, term)) = self
            .error_handler
            .handle(result, "get_last_log_index", None)
        {
            if index < self.last_snapshot_index {
                self.last_log_index = self.last_snapshot_index;
                self.last_log_term = self.last_snapshot_term;
            } else {
                self.last_log_index = index;
                self.last_log_term = term;
            }
        }
    }

    /// 统一保存 HardState
    pub(crate) async fn persist_hard_state(&mut self) {
        let hard_state = HardState {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        let result = self.storage.save_hard_state(hard_state).await;
        self.error_handler
            .handle_void(result, "save_hard_state", None);
    }

    pub(crate) async fn persist_topology(&mut self) {
        let result = self.storage.save_topology(&self.topology).await;
        self.error_handler.handle_void(result, "save_topology", None);
    }

    /// Adopts `term` if it is newer, clearing the vote.
    pub(crate) async fn update_term(&mut self, term: u64) {
        if term > self.current_term {
            info!(
                "Node {} updating term from {} to {}",
                self.name, self.current_term, term
            );
            self.current_term = term;
            self.voted_for = None;
            // The old leader is not the leader of the new term.
            self.leader_id = None;
            self.persist_hard_state().await;
        }
    }

    /// 清理 Leader 专用状态（角色切换时调用）
    pub(crate) fn clear_leader_state(&mut self, reason: ClientError) {
        self.next_index.clear();
        self.match_index.clear();
        self.snapshot_states.clear();

        // A pending transfer wanted this node to stop leading, so it succeeded.
        if let Some(transfer) = self.leader_transfer.take() {
            self.timers.del_timer(transfer.timer);
            let _ = transfer.completion.send(Ok(()));
        }

        self.fail_pending(reason);

        if let Some(timer_id) = self.heartbeat_timer.take() {
            self.timers.del_timer(timer_id);
        }
    }

    /// Fails every waiting proposal and topology change.
    pub(crate) fn fail_pending(&mut self, reason: ClientError) {
        for (_, completion) in std::mem::take(&mut self.pending_commands) {
            let _ = completion.send(Err(reason.clone()));
        }
        if let Some((_, completion)) = self.pending_topology_change.take() {
            let _ = completion.send(Err(reason));
        }
    }

    /// Becomes Follower, adopting `new_term` when it is newer.
    pub(crate) async fn step_down_to_follower(&mut self, new_term: Option<u64>) {
        if let Some(term) = new_term {
            self.update_term(term).await;
        }

        let previous = self.role;
        self.role = Role::Follower;
        self.election = None;
        if previous == Role::Leader {
            self.leader_id = None;
            self.clear_leader_state(ClientError::LeadershipLost);
        }
        if previous != Role::Follower {
            info!(
                "Node {} stepped down from {} to Follower in term {}",
                self.name, previous, self.current_term
            );
        }
        self.reset_election_timer();
    }

    /// Recognises `leader` for `term`. Called on every valid message from a leader.
    pub(crate) async fn follow(&mut self, term: u64, leader: &NodeName) {
        if term > self.current_term || self.role != Role::Follower {
            self.step_down_to_follower(Some(term)).await;
        }
        if self.leader_id.as_ref() != Some(leader) {
            info!(
                "Node {} following leader {} in term {}",
                self.name, leader, self.current_term
            );
            self.leader_id = Some(leader.clone());
        }
        self.last_heartbeat = Instant::now();
        self.reset_election_timer();
    }

    /// Called when the loop exits.
    pub fn shutdown(&mut self) {
        info!("Node {} shutting down", self.name);
        self.fail_pending(ClientError::ShuttingDown);
        if let Some(transfer) = self.leader_transfer.take() {
            let _ = transfer.completion.send(Err(ClientError::ShuttingDown));
        }
        for timer in [self.election_timer.take(), self.heartbeat_timer.take()]
            .into_iter()
            .flatten()
        {
            self.timers.del_timer(timer);
        }
        self.publish_status();
    }

    pub(crate) fn publish_status(&self) {
        let stopped = self.is_stopped();
        self.status.send_if_modified(|status| {
            let topology_changed = *status.topology != self.topology;
            let changed = status.role != self.role
                || status.term != self.current_term
                || status.leader != self.leader_id
                || status.commit_index != self.commit_index
                || status.last_applied != self.last_applied
                || status.last_log_index != self.last_log_index
                || status.stopped != stopped
                || topology_changed;
            if changed {
                status.name = self.name.clone();
                status.role = self.role;
                status.term = self.current_term;
                status.leader = self.leader_id.clone();
                status.commit_index = self.commit_index;
                status.last_applied = self.last_applied;
                status.last_log_index = self.last_log_index;
                status.stopped = stopped;
                if topology_changed {
                    status.topology = Arc::new(self.topology.clone());
                }
            }
            changed
        });
    }
}
