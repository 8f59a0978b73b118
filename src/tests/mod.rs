//! Engine-level tests driving `RaftState` directly with recording collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::bus::MessageBus;
use crate::codec::SnapshotStream;
use crate::error::{ClientError, StorageError};
use crate::event::{ClientResult, Command, Event, Reply, Role};
use crate::message::*;
use crate::state::{EngineStatus, RaftOptions, RaftState, RaftStateDeps};
use crate::storage::MemoryStorage;
use crate::topology::{Membership, Topology, TopologyChange};
use crate::traits::*;
use crate::types::{NodeConnectionInfo, NodeName, TimerId, TopologyId};

// === 测试用的协作者 ===

#[derive(Debug, Clone)]
enum Sent {
    Vote(RequestVoteRequest),
    Append(AppendEntriesRequest),
    CanInstall(CanInstallSnapshotRequest),
    Install(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
    Disconnected(DisconnectedFromCluster),
}

#[derive(Default)]
struct RecordingNetwork {
    sent: Mutex<Vec<(NodeName, Sent)>>,
}

impl RecordingNetwork {
    fn take(&self) -> Vec<(NodeName, Sent)> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn record(&self, dest: &NodeConnectionInfo, message: Sent) {
        self.sent.lock().push((dest.name.clone(), message));
    }
}

impl Network for RecordingNetwork {
    fn send_request_vote(&self, dest: &NodeConnectionInfo, req: RequestVoteRequest) {
        self.record(dest, Sent::Vote(req));
    }

    fn send_append_entries(&self, dest: &NodeConnectionInfo, req: AppendEntriesRequest) {
        self.record(dest, Sent::Append(req));
    }

    fn send_can_install_snapshot(&self, dest: &NodeConnectionInfo, req: CanInstallSnapshotRequest) {
        self.record(dest, Sent::CanInstall(req));
    }

    fn send_install_snapshot(
        &self,
        dest: &NodeConnectionInfo,
        req: InstallSnapshotRequest,
        _body: SnapshotStream,
    ) {
        self.record(dest, Sent::Install(req));
    }

    fn send_timeout_now(&self, dest: &NodeConnectionInfo, req: TimeoutNowRequest) {
        self.record(dest, Sent::TimeoutNow(req));
    }

    fn send_disconnected_from_cluster(
        &self,
        dest: &NodeConnectionInfo,
        req: DisconnectedFromCluster,
    ) {
        self.record(dest, Sent::Disconnected(req));
    }
}

/// Timers that never fire on their own; tests deliver the events.
#[derive(Default)]
struct ManualTimers {
    next_id: AtomicU64,
    active: Mutex<HashMap<TimerId, &'static str>>,
}

impl ManualTimers {
    fn set(&self, kind: &'static str) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.lock().insert(id, kind);
        id
    }
}

impl TimerService for ManualTimers {
    fn del_timer(&self, timer_id: TimerId) {
        self.active.lock().remove(&timer_id);
    }

    fn set_election_timer(&self, _dur: Duration) -> TimerId {
        self.set("election")
    }

    fn set_heartbeat_timer(&self, _dur: Duration) -> TimerId {
        self.set("heartbeat")
    }

    fn set_leader_transfer_timer(&self, _dur: Duration) -> TimerId {
        self.set("leader_transfer")
    }
}

#[derive(Default)]
struct RecordingStateMachine {
    applied: Mutex<Vec<(u64, Vec<u8>)>>,
    snapshot: Mutex<Option<SnapshotMeta>>,
}

impl RecordingStateMachine {
    fn applied(&self) -> Vec<(u64, Vec<u8>)> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl StateMachine for RecordingStateMachine {
    fn last_applied_index(&self) -> u64 {
        self.applied.lock().last().map(|(index, _)| *index).unwrap_or(0)
    }

    async fn apply(&self, index: u64, _term: u64, data: &[u8]) -> ApplyResult<()> {
        self.applied.lock().push((index, data.to_vec()));
        Ok(())
    }

    async fn create_snapshot(&self, meta: SnapshotMeta) -> SnapshotResult<()> {
        *self.snapshot.lock() = Some(meta);
        Ok(())
    }

    async fn read_snapshot(&self) -> SnapshotResult<Option<SnapshotReader>> {
        Ok(self.snapshot.lock().clone().map(|meta| SnapshotReader {
            meta,
            body: Box::pin(futures::stream::empty::<std::io::Result<bytes::Bytes>>()),
        }))
    }

    async fn install_snapshot(
        &self,
        _meta: SnapshotMeta,
        _body: SnapshotStream,
    ) -> SnapshotResult<()> {
        Ok(())
    }
}

/// Memory storage whose appends can be made to fail with an IO error.
#[derive(Default)]
struct FailingStorage {
    inner: MemoryStorage,
    fail_appends: AtomicBool,
}

#[async_trait]
impl HardStateStorage for FailingStorage {
    async fn save_hard_state(&self, hard_state: HardState) -> StorageResult<()> {
        self.inner.save_hard_state(hard_state).await
    }

    async fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        self.inner.load_hard_state().await
    }
}

#[async_trait]
impl LogEntryStorage for FailingStorage {
    async fn append_log_entries(&self, entries: &[LogEntry]) -> StorageResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.append_log_entries(entries).await
    }

    async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        self.inner.get_log_entries(low, high).await
    }

    async fn truncate_log_suffix(&self, idx: u64) -> StorageResult<()> {
        self.inner.truncate_log_suffix(idx).await
    }

    async fn truncate_log_prefix(&self, idx: u64) -> StorageResult<()> {
        self.inner.truncate_log_prefix(idx).await
    }

    async fn get_last_log_index(&self) -> StorageResult<(u64, u64)> {
        self.inner.get_last_log_index().await
    }

    async fn get_log_term(&self, idx: u64) -> StorageResult<u64> {
        self.inner.get_log_term(idx).await
    }
}

#[async_trait]
impl SnapshotMetaStorage for FailingStorage {
    async fn save_snapshot_meta(&self, meta: SnapshotMeta) -> StorageResult<()> {
        self.inner.save_snapshot_meta(meta).await
    }

    async fn load_snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        self.inner.load_snapshot_meta().await
    }
}

#[async_trait]
impl TopologyStorage for FailingStorage {
    async fn save_topology(&self, topology: &Topology) -> StorageResult<()> {
        self.inner.save_topology(topology).await
    }

    async fn load_topology(&self) -> StorageResult<Option<Topology>> {
        self.inner.load_topology().await
    }
}

impl Storage for FailingStorage {}

// === 测试辅助 ===

struct TestNode {
    state: RaftState,
    network: Arc<RecordingNetwork>,
    storage: Arc<FailingStorage>,
    machine: Arc<RecordingStateMachine>,
    _status: watch::Receiver<EngineStatus>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node_info(name: &str) -> NodeConnectionInfo {
    NodeConnectionInfo::new(name, format!("mem://{}", name))
}

fn three_node_topology() -> Topology {
    Topology::with_voters(
        TopologyId::new(),
        [node_info("a"), node_info("b"), node_info("c")],
    )
}

async fn create_test_node(name: &str, topology: Topology) -> TestNode {
    create_test_node_with_log(name, topology, HardState { term: 0, voted_for: None }, &[]).await
}

async fn create_test_node_with_log(
    name: &str,
    topology: Topology,
    hard_state: HardState,
    entries: &[LogEntry],
) -> TestNode {
    init_tracing();
    let storage = Arc::new(FailingStorage::default());
    storage.save_topology(&topology).await.unwrap();
    storage.save_hard_state(hard_state).await.unwrap();
    storage.append_log_entries(entries).await.unwrap();

    let network = Arc::new(RecordingNetwork::default());
    let machine = Arc::new(RecordingStateMachine::default());
    let (status_tx, status_rx) = watch::channel(EngineStatus::initial(name.to_string()));
    let mut state = RaftState::new(
        RaftOptions::default(),
        node_info(name),
        RaftStateDeps {
            storage: storage.clone(),
            state_machine: machine.clone(),
            network: network.clone(),
            timers: Arc::new(ManualTimers::default()),
            bus: MessageBus::new(),
            status: status_tx,
        },
    )
    .await
    .unwrap();
    state.start();

    TestNode {
        state,
        network,
        storage,
        machine,
        _status: status_rx,
    }
}

impl TestNode {
    async fn fire_election_timeout(&mut self) {
        let timer = self.state.election_timer.expect("election timer armed");
        self.state.handle_event(Event::ElectionTimeout(timer)).await;
    }

    async fn fire_heartbeat_timeout(&mut self) {
        let timer = self.state.heartbeat_timer.expect("heartbeat timer armed");
        self.state.handle_event(Event::HeartbeatTimeout(timer)).await;
    }

    fn topology_id(&self) -> TopologyId {
        self.state.topology.topology_id
    }

    fn vote(&self, from: &str, term: u64, trial_only: bool, granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: if trial_only { term - 1 } else { term },
            vote_term: term,
            vote_granted: granted,
            trial_only,
            message: String::new(),
            from: from.to_string(),
            cluster_topology_id: self.topology_id(),
        }
    }

    fn append_ack(&self, from: &str, last_log_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.state.current_term,
            success: true,
            last_log_index,
            leader_id: Some(self.state.name.clone()),
            message: String::new(),
            from: from.to_string(),
            cluster_topology_id: self.topology_id(),
        }
    }

    async fn ack(&mut self, from: &str, last_log_index: u64) {
        let response = self.append_ack(from, last_log_index);
        self.state
            .handle_event(Event::AppendEntriesResponse(response))
            .await;
    }

    /// Runs the trial and real rounds with `b` voting yes.
    async fn elect(&mut self) {
        self.fire_election_timeout().await;
        let term = self.state.current_term + 1;
        let trial = self.vote("b", term, true, true);
        self.state.handle_event(Event::RequestVoteResponse(trial)).await;
        let real = self.vote("b", term, false, true);
        self.state.handle_event(Event::RequestVoteResponse(real)).await;
        assert_eq!(self.state.get_role(), Role::Leader);
        self.network.take();
    }

    async fn propose(&mut self, data: &[u8]) -> oneshot::Receiver<ClientResult<u64>> {
        let (completion, rx) = oneshot::channel();
        self.state
            .handle_event(Event::ClientPropose(Command {
                data: data.to_vec(),
                completion,
            }))
            .await;
        rx
    }

    async fn request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        let (reply, mut rx) = Reply::channel();
        self.state
            .handle_event(Event::RequestVoteRequest(request, reply))
            .await;
        rx.try_recv().expect("vote answered")
    }

    async fn append_entries(&mut self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (reply, mut rx) = Reply::channel();
        self.state
            .handle_event(Event::AppendEntriesRequest(request, reply))
            .await;
        rx.try_recv().expect("append answered")
    }
}

fn entry(index: u64, term: u64) -> LogEntry {
    LogEntry::new(index, term, format!("cmd-{}", index).into_bytes())
}

fn vote_request(from: &str, term: u64, cluster: TopologyId) -> RequestVoteRequest {
    RequestVoteRequest {
        term,
        last_log_index: 0,
        last_log_term: 0,
        trial_only: false,
        forced_election: false,
        from: from.to_string(),
        cluster_topology_id: cluster,
    }
}

fn append_request(
    from: &str,
    term: u64,
    prev: (u64, u64),
    entries: Vec<LogEntry>,
    leader_commit: u64,
    cluster: TopologyId,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_commit,
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        entries,
        from: from.to_string(),
        cluster_topology_id: cluster,
    }
}

// === 选举 ===

#[tokio::test]
async fn test_trial_election_does_not_change_term() {
    let mut node = create_test_node("a", three_node_topology()).await;

    node.fire_election_timeout().await;

    assert_eq!(node.state.get_role(), Role::Candidate);
    assert_eq!(node.state.get_current_term(), 0);
    assert_eq!(node.state.voted_for, None);
    let sent = node.network.take();
    assert_eq!(sent.len(), 2);
    for (_, message) in sent {
        let Sent::Vote(request) = message else {
            panic!("expected vote requests only");
        };
        assert!(request.trial_only);
        assert_eq!(request.term, 1);
    }
    let hard_state = node.storage.load_hard_state().await.unwrap().unwrap();
    assert_eq!(hard_state.term, 0);
}

#[tokio::test]
async fn test_leader_election_success() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.fire_election_timeout().await;
    node.network.take();

    let trial = node.vote("b", 1, true, true);
    node.state.handle_event(Event::RequestVoteResponse(trial)).await;
    assert_eq!(node.state.get_current_term(), 1);
    assert_eq!(node.state.voted_for.as_deref(), Some("a"));
    let real_requests = node
        .network
        .take()
        .into_iter()
        .filter(|(_, m)| matches!(m, Sent::Vote(r) if !r.trial_only && r.term == 1))
        .count();
    assert_eq!(real_requests, 2);

    let real = node.vote("c", 1, false, true);
    node.state.handle_event(Event::RequestVoteResponse(real)).await;
    assert_eq!(node.state.get_role(), Role::Leader);
    assert_eq!(node.state.leader_id.as_deref(), Some("a"));

    // The new leader appends a no-op of its own term and replicates it.
    let noop = node.storage.get_log_entries(1, 2).await.unwrap();
    assert!(noop[0].is_noop());
    assert_eq!(noop[0].term, 1);
    let appends: Vec<_> = node
        .network
        .take()
        .into_iter()
        .filter_map(|(to, m)| match m {
            Sent::Append(request) => Some((to, request)),
            _ => None,
        })
        .collect();
    assert_eq!(appends.len(), 2);
    assert!(appends.iter().all(|(_, r)| r.entries.len() == 1 && r.prev_log_index == 0));
}

#[tokio::test]
async fn test_candidate_steps_down_on_higher_term_rejection() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.fire_election_timeout().await;

    let mut rejection = node.vote("b", 1, true, false);
    rejection.term = 5;
    node.state
        .handle_event(Event::RequestVoteResponse(rejection))
        .await;

    assert_eq!(node.state.get_role(), Role::Follower);
    assert_eq!(node.state.get_current_term(), 5);
}

#[tokio::test]
async fn test_request_vote_handling() {
    let mut node = create_test_node("a", three_node_topology()).await;
    let cluster = node.topology_id();

    let response = node.request_vote(vote_request("b", 1, cluster)).await;
    assert!(response.vote_granted);
    let hard_state = node.storage.load_hard_state().await.unwrap().unwrap();
    assert_eq!(hard_state.term, 1);
    assert_eq!(hard_state.voted_for.as_deref(), Some("b"));

    // Only one vote per term.
    let response = node.request_vote(vote_request("c", 1, cluster)).await;
    assert!(!response.vote_granted);

    // A trial request for a later term is answered without adopting the term.
    let mut trial = vote_request("c", 2, cluster);
    trial.trial_only = true;
    let response = node.request_vote(trial).await;
    assert!(response.vote_granted);
    assert!(response.trial_only);
    assert_eq!(node.state.get_current_term(), 1);
}

#[tokio::test]
async fn test_request_vote_rejects_outdated_log_and_foreign_cluster() {
    let mut node = create_test_node_with_log(
        "a",
        three_node_topology(),
        HardState { term: 2, voted_for: None },
        &[entry(1, 1), entry(2, 2)],
    )
    .await;
    let cluster = node.topology_id();

    let mut behind = vote_request("b", 3, cluster);
    behind.last_log_index = 5;
    behind.last_log_term = 1;
    let response = node.request_vote(behind).await;
    assert!(!response.vote_granted);
    assert_eq!(node.state.get_current_term(), 3);

    let mut foreign = vote_request("b", 4, TopologyId::new());
    foreign.last_log_index = 2;
    foreign.last_log_term = 2;
    let response = node.request_vote(foreign).await;
    assert!(!response.vote_granted);
    assert_eq!(node.state.get_current_term(), 3);

    let old = vote_request("b", 1, cluster);
    assert!(!node.request_vote(old).await.vote_granted);
}

#[tokio::test]
async fn test_vote_rejected_while_leader_is_alive() {
    let mut node = create_test_node("a", three_node_topology()).await;
    let cluster = node.topology_id();
    let response = node
        .append_entries(append_request("b", 1, (0, 0), vec![], 0, cluster))
        .await;
    assert!(response.success);

    let response = node.request_vote(vote_request("c", 2, cluster)).await;
    assert!(!response.vote_granted);
    assert_eq!(node.state.get_current_term(), 1);
    assert_eq!(node.state.leader_id.as_deref(), Some("b"));

    // Leadership transfer overrides stickiness.
    let mut forced = vote_request("c", 2, cluster);
    forced.forced_election = true;
    let response = node.request_vote(forced).await;
    assert!(response.vote_granted);
    assert_eq!(node.state.get_current_term(), 2);
}

#[tokio::test]
async fn test_stale_election_timer_is_ignored() {
    let mut node = create_test_node("a", three_node_topology()).await;
    let current = node.state.election_timer.unwrap();
    node.state
        .handle_event(Event::ElectionTimeout(current + 100))
        .await;
    assert_eq!(node.state.get_role(), Role::Follower);
    assert!(node.network.take().is_empty());
}

#[tokio::test]
async fn test_non_voter_never_campaigns() {
    let mut topology = three_node_topology();
    topology.non_voting_nodes.insert("d".into(), node_info("d"));
    let mut node = create_test_node("d", topology).await;
    node.fire_election_timeout().await;
    assert_eq!(node.state.get_role(), Role::Follower);
    assert!(node.network.take().is_empty());
}

// === 日志复制 ===

#[tokio::test]
async fn test_append_entries_gap_and_term_mismatch() {
    let mut node = create_test_node("a", three_node_topology()).await;
    let cluster = node.topology_id();

    let response = node
        .append_entries(append_request("b", 1, (5, 1), vec![entry(6, 1)], 0, cluster))
        .await;
    assert!(!response.success);
    assert_eq!(response.last_log_index, 0);

    let response = node
        .append_entries(append_request(
            "b",
            1,
            (0, 0),
            vec![entry(1, 1), entry(2, 1), entry(3, 1)],
            1,
            cluster,
        ))
        .await;
    assert!(response.success);
    assert_eq!(response.last_log_index, 3);
    assert_eq!(node.state.get_commit_index(), 1);
    assert_eq!(node.machine.applied(), vec![(1, b"cmd-1".to_vec())]);

    let response = node
        .append_entries(append_request("b", 2, (3, 2), vec![], 1, cluster))
        .await;
    assert!(!response.success);
    assert_eq!(response.last_log_index, 2);
}

#[tokio::test]
async fn test_log_replication_conflict_resolution() {
    let mut node = create_test_node("a", three_node_topology()).await;
    let cluster = node.topology_id();
    node.append_entries(append_request(
        "b",
        1,
        (0, 0),
        vec![entry(1, 1), entry(2, 1), entry(3, 1)],
        1,
        cluster,
    ))
    .await;

    let response = node
        .append_entries(append_request("c", 2, (1, 1), vec![entry(2, 2)], 1, cluster))
        .await;
    assert!(response.success);
    assert_eq!(response.last_log_index, 2);
    assert_eq!(node.state.last_log_index, 2);
    assert_eq!(node.state.last_log_term, 2);
    let stored = node.storage.get_log_entries(1, 10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].term, 2);
    assert_eq!(node.state.leader_id.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_append_entries_from_older_term_is_rejected() {
    let mut node = create_test_node_with_log(
        "a",
        three_node_topology(),
        HardState { term: 3, voted_for: None },
        &[],
    )
    .await;
    let cluster = node.topology_id();
    let response = node
        .append_entries(append_request("b", 2, (0, 0), vec![entry(1, 2)], 0, cluster))
        .await;
    assert!(!response.success);
    assert_eq!(response.term, 3);
    assert_eq!(node.state.last_log_index, 0);
}

#[tokio::test]
async fn test_leader_backtracks_next_index() {
    let mut node = create_test_node_with_log(
        "a",
        three_node_topology(),
        HardState { term: 1, voted_for: None },
        &[entry(1, 1), entry(2, 1), entry(3, 1)],
    )
    .await;
    node.elect().await;
    assert_eq!(node.state.next_index["b"], 4);

    let mut rejection = node.append_ack("b", 1);
    rejection.success = false;
    node.state
        .handle_event(Event::AppendEntriesResponse(rejection))
        .await;

    assert_eq!(node.state.next_index["b"], 2);
    let resend = node
        .network
        .take()
        .into_iter()
        .find_map(|(to, m)| match m {
            Sent::Append(request) if to == "b" => Some(request),
            _ => None,
        })
        .expect("entries resent to b");
    assert_eq!(resend.prev_log_index, 1);
    assert_eq!(resend.entries.first().map(|e| e.index), Some(2));
}

#[tokio::test]
async fn test_commit_requires_current_term_majority() {
    let mut node = create_test_node_with_log(
        "a",
        three_node_topology(),
        HardState { term: 1, voted_for: None },
        &[entry(1, 1), entry(2, 1)],
    )
    .await;
    node.elect().await;
    assert_eq!(node.state.get_current_term(), 2);
    assert_eq!(node.state.last_log_index, 3);

    // A majority holds index 2, but it belongs to an earlier term.
    node.ack("b", 2).await;
    assert_eq!(node.state.get_commit_index(), 0);

    node.ack("b", 3).await;
    assert_eq!(node.state.get_commit_index(), 3);
    let applied: Vec<u64> = node.machine.applied().iter().map(|(i, _)| *i).collect();
    assert_eq!(applied, vec![1, 2]);
}

// === 客户端请求 ===

#[tokio::test]
async fn test_client_propose_commits_after_majority() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;

    let mut rx = node.propose(b"set x").await;
    assert_eq!(node.state.last_log_index, 2);
    assert!(rx.try_recv().is_err());

    node.ack("c", 2).await;
    assert_eq!(rx.try_recv().unwrap(), Ok(2));
    assert_eq!(node.machine.applied(), vec![(2, b"set x".to_vec())]);
}

#[tokio::test]
async fn test_newer_term_forgets_the_old_leader() {
    let mut node = create_test_node("b", three_node_topology()).await;
    let cluster = node.topology_id();
    node.append_entries(append_request("a", 1, (0, 0), vec![], 0, cluster))
        .await;
    assert_eq!(node.state.leader_id.as_deref(), Some("a"));

    let mut request = vote_request("c", 3, cluster);
    request.forced_election = true;
    let response = node.request_vote(request).await;
    assert!(response.vote_granted);
    assert_eq!(node.state.get_current_term(), 3);
    assert_eq!(node.state.leader_id, None);

    let mut rx = node.propose(b"set x").await;
    assert_eq!(
        rx.try_recv().unwrap(),
        Err(ClientError::NotLeading { leader: None })
    );
}

#[tokio::test]
async fn test_propose_on_follower_returns_not_leading() {
    let mut node = create_test_node("a", three_node_topology()).await;
    let cluster = node.topology_id();
    node.append_entries(append_request("b", 1, (0, 0), vec![], 0, cluster))
        .await;

    let mut rx = node.propose(b"set x").await;
    assert_eq!(
        rx.try_recv().unwrap(),
        Err(ClientError::NotLeading {
            leader: Some("b".into())
        })
    );
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    let mut rx = node.propose(b"").await;
    assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::BadRequest(_))));
}

#[tokio::test]
async fn test_leadership_lost_fails_pending_commands() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    let mut rx = node.propose(b"set x").await;

    let mut higher = node.append_ack("b", 0);
    higher.term = 7;
    higher.success = false;
    node.state
        .handle_event(Event::AppendEntriesResponse(higher))
        .await;

    assert_eq!(node.state.get_role(), Role::Follower);
    assert_eq!(node.state.get_current_term(), 7);
    assert_eq!(rx.try_recv().unwrap(), Err(ClientError::LeadershipLost));
}

#[tokio::test]
async fn test_fatal_storage_error_stops_node() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;

    node.storage.fail_appends.store(true, Ordering::SeqCst);
    let mut rx = node.propose(b"set x").await;
    assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::Internal(_))));
    assert!(node.state.is_stopped());

    // Everything after the failure is dropped.
    node.storage.fail_appends.store(false, Ordering::SeqCst);
    let mut rx = node.propose(b"set y").await;
    assert!(rx.try_recv().is_err());
}

// === 拓扑变更 ===

#[tokio::test]
async fn test_voting_join_goes_through_promotable() {
    let mut node = create_test_node("a", Topology::bootstrap(node_info("a"))).await;
    node.fire_election_timeout().await;
    assert_eq!(node.state.get_role(), Role::Leader);
    assert_eq!(node.state.get_commit_index(), 1);

    let (completion, mut rx) = oneshot::channel();
    node.state
        .handle_event(Event::ChangeTopology {
            change: TopologyChange::Add {
                node: node_info("d"),
                membership: Membership::Voter,
            },
            completion,
        })
        .await;
    assert_eq!(rx.try_recv().unwrap(), Ok(()));
    assert_eq!(
        node.state.topology.membership("d"),
        Some(Membership::Promotable)
    );

    node.ack("d", 2).await;
    assert_eq!(node.state.topology.membership("d"), Some(Membership::Voter));
    assert_eq!(node.state.get_commit_index(), 3);
    let saved = node.storage.load_topology().await.unwrap().unwrap();
    assert!(saved.is_voter("d"));
}

#[tokio::test]
async fn test_one_topology_change_at_a_time() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;

    let (first, mut first_rx) = oneshot::channel();
    node.state
        .handle_event(Event::ChangeTopology {
            change: TopologyChange::Remove { name: "c".into() },
            completion: first,
        })
        .await;
    assert!(first_rx.try_recv().is_err());

    let (second, mut second_rx) = oneshot::channel();
    node.state
        .handle_event(Event::ChangeTopology {
            change: TopologyChange::Add {
                node: node_info("d"),
                membership: Membership::NonVoter,
            },
            completion: second,
        })
        .await;
    assert_eq!(
        second_rx.try_recv().unwrap(),
        Err(crate::error::TopologyError::ChangeInProgress.into())
    );

    // Committing the removal notifies the removed node.
    node.ack("b", 2).await;
    assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
    assert!(!node.state.topology.contains("c"));
    let notified = node
        .network
        .take()
        .into_iter()
        .any(|(to, m)| to == "c" && matches!(m, Sent::Disconnected(_)));
    assert!(notified);
}

#[tokio::test]
async fn test_leader_cannot_remove_itself() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    let (completion, mut rx) = oneshot::channel();
    node.state
        .handle_event(Event::ChangeTopology {
            change: TopologyChange::Remove { name: "a".into() },
            completion,
        })
        .await;
    assert_eq!(
        rx.try_recv().unwrap(),
        Err(crate::error::TopologyError::RemovingLeader.into())
    );
}

#[tokio::test]
async fn test_disconnected_from_cluster_resets_topology() {
    let mut node = create_test_node("c", three_node_topology()).await;
    let cluster = node.topology_id();
    node.append_entries(append_request("a", 1, (0, 0), vec![], 0, cluster))
        .await;

    node.state
        .handle_event(Event::DisconnectedFromCluster(DisconnectedFromCluster {
            term: 1,
            topology_index: 1,
            from: "a".into(),
            cluster_topology_id: cluster,
        }))
        .await;

    assert!(node.state.topology.is_empty());
    assert_ne!(node.topology_id(), cluster);
    assert_eq!(node.state.leader_id, None);

    // A fresh node accepts whichever cluster replicates to it next.
    let other = TopologyId::new();
    let response = node
        .append_entries(append_request("x", 2, (0, 0), vec![], 0, other))
        .await;
    assert!(response.success);
}

#[tokio::test]
async fn test_stale_disconnect_notice_is_ignored_after_rejoin() {
    let topology = three_node_topology();
    let cluster = topology.topology_id;
    let mut node = create_test_node("c", topology.clone()).await;

    // c was removed at index 1 and added back by the topology entry at index 2.
    let mut rejoined = topology.clone();
    rejoined.index = 2;
    let entries = vec![
        entry(1, 1),
        LogEntry::topology(2, 1, rejoined.encode().unwrap()),
    ];
    let response = node
        .append_entries(append_request("a", 1, (0, 0), entries, 2, cluster))
        .await;
    assert!(response.success);
    assert_eq!(node.state.topology.index, 2);

    let notice = |topology_index| {
        Event::DisconnectedFromCluster(DisconnectedFromCluster {
            term: 1,
            topology_index,
            from: "a".into(),
            cluster_topology_id: cluster,
        })
    };
    node.state.handle_event(notice(1)).await;
    assert!(node.state.topology.contains("c"));
    assert_eq!(node.topology_id(), cluster);

    node.state.handle_event(notice(3)).await;
    assert!(node.state.topology.is_empty());
    assert_ne!(node.topology_id(), cluster);
}

// === 领导权转移 ===

#[tokio::test]
async fn test_step_down_sends_timeout_now_to_caught_up_voter() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    node.ack("c", 1).await;
    node.network.take();

    let (completion, mut rx) = oneshot::channel();
    node.state
        .handle_event(Event::StepDown { completion })
        .await;

    assert_eq!(rx.try_recv().unwrap(), Ok(()));
    assert_eq!(node.state.get_role(), Role::Follower);
    let target = node
        .network
        .take()
        .into_iter()
        .find_map(|(to, m)| matches!(m, Sent::TimeoutNow(_)).then_some(to));
    assert_eq!(target.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_timeout_now_starts_forced_election() {
    let mut node = create_test_node("b", three_node_topology()).await;
    let cluster = node.topology_id();
    node.append_entries(append_request("a", 1, (0, 0), vec![], 0, cluster))
        .await;
    node.network.take();

    node.state
        .handle_event(Event::TimeoutNow(TimeoutNowRequest {
            term: 1,
            from: "a".into(),
            cluster_topology_id: cluster,
        }))
        .await;

    assert_eq!(node.state.get_role(), Role::Candidate);
    assert_eq!(node.state.get_current_term(), 2);
    let forced = node
        .network
        .take()
        .into_iter()
        .all(|(_, m)| matches!(m, Sent::Vote(r) if r.forced_election && !r.trial_only));
    assert!(forced);
}

#[tokio::test]
async fn test_timeout_now_from_newer_term_is_adopted_first() {
    let mut node = create_test_node("b", three_node_topology()).await;
    let cluster = node.topology_id();
    node.append_entries(append_request("a", 1, (0, 0), vec![], 0, cluster))
        .await;
    node.network.take();

    node.state
        .handle_event(Event::TimeoutNow(TimeoutNowRequest {
            term: 4,
            from: "a".into(),
            cluster_topology_id: cluster,
        }))
        .await;

    assert_eq!(node.state.get_role(), Role::Candidate);
    assert_eq!(node.state.get_current_term(), 5);
    let terms: Vec<u64> = node
        .network
        .take()
        .into_iter()
        .filter_map(|(_, m)| match m {
            Sent::Vote(r) => Some(r.term),
            _ => None,
        })
        .collect();
    assert_eq!(terms, vec![5, 5]);
}

// === 快照 ===

#[tokio::test]
async fn test_lagging_follower_is_offered_a_snapshot() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    let mut rx = node.propose(b"set x").await;
    node.ack("b", 2).await;
    assert_eq!(rx.try_recv().unwrap(), Ok(2));

    node.state.handle_event(Event::CreateSnapshot).await;
    assert_eq!(node.state.last_snapshot_index, 2);
    node.network.take();

    // c never acknowledged anything; its next entries were compacted.
    let mut rejection = node.append_ack("c", 0);
    rejection.success = false;
    node.state.next_index.insert("c".into(), 2);
    node.state
        .handle_event(Event::AppendEntriesResponse(rejection))
        .await;
    let offered = node
        .network
        .take()
        .into_iter()
        .any(|(to, m)| to == "c" && matches!(m, Sent::CanInstall(r) if r.index == 2));
    assert!(offered);
}

#[tokio::test]
async fn test_lost_snapshot_offer_is_repeated_on_heartbeat() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    let mut rx = node.propose(b"set x").await;
    node.ack("b", 2).await;
    assert_eq!(rx.try_recv().unwrap(), Ok(2));
    node.state.handle_event(Event::CreateSnapshot).await;

    let mut rejection = node.append_ack("c", 0);
    rejection.success = false;
    node.state.next_index.insert("c".into(), 2);
    node.state
        .handle_event(Event::AppendEntriesResponse(rejection))
        .await;
    // The offer and its answer are lost.
    node.network.take();

    for _ in 0..3 {
        node.fire_heartbeat_timeout().await;
        let to_c: Vec<Sent> = node
            .network
            .take()
            .into_iter()
            .filter(|(to, _)| to == "c")
            .map(|(_, m)| m)
            .collect();
        assert_eq!(to_c.len(), 1);
        assert!(matches!(&to_c[0], Sent::CanInstall(r) if r.index == 2));
    }

    // Once c accepts, the snapshot is streamed and the offers stop.
    let accept = CanInstallSnapshotResponse {
        term: node.state.current_term,
        index: 2,
        success: true,
        is_currently_installing: false,
        message: String::new(),
        from: "c".into(),
        cluster_topology_id: node.topology_id(),
    };
    node.state
        .handle_event(Event::CanInstallSnapshotResponse(accept))
        .await;
    node.fire_heartbeat_timeout().await;
    let to_c: Vec<Sent> = node
        .network
        .take()
        .into_iter()
        .filter(|(to, _)| to == "c")
        .map(|(_, m)| m)
        .collect();
    assert_eq!(to_c.len(), 1);
    assert!(matches!(&to_c[0], Sent::Install(r) if r.last_included_index == 2));
}

#[tokio::test]
async fn test_log_converges_under_duplicated_and_reordered_appends() {
    let topology = three_node_topology();
    let cluster = topology.topology_id;
    let batches = [
        append_request("a", 2, (0, 0), vec![entry(1, 1), entry(2, 2), entry(3, 2)], 0, cluster),
        append_request("a", 2, (3, 2), vec![entry(4, 2), entry(5, 2)], 3, cluster),
        append_request("a", 2, (5, 2), vec![entry(6, 2)], 5, cluster),
    ];

    let mut in_order = create_test_node("b", topology.clone()).await;
    for batch in &batches {
        assert!(in_order.append_entries(batch.clone()).await.success);
    }

    let mut shuffled = create_test_node("b", topology).await;
    for i in [2, 1, 0, 0, 2, 1, 0, 2, 1, 2] {
        shuffled.append_entries(batches[i].clone()).await;
    }

    let expected = in_order.storage.get_log_entries(1, 7).await.unwrap();
    assert_eq!(expected.len(), 6);
    assert_eq!(shuffled.storage.get_log_entries(1, 7).await.unwrap(), expected);
    assert_eq!(shuffled.state.last_log_index, 6);
    assert_eq!(in_order.state.get_commit_index(), 5);
    assert_eq!(shuffled.state.get_commit_index(), 5);
    assert_eq!(shuffled.machine.applied(), in_order.machine.applied());
}

#[tokio::test]
async fn test_snapshot_carries_topology_as_of_its_index() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    let mut rx = node.propose(b"set x").await;
    node.ack("b", 2).await;
    assert_eq!(rx.try_recv().unwrap(), Ok(2));
    node.state.handle_event(Event::CreateSnapshot).await;

    // A later change commits after the snapshot was taken.
    let (completion, mut change_rx) = oneshot::channel();
    node.state
        .handle_event(Event::ChangeTopology {
            change: TopologyChange::Add {
                node: node_info("d"),
                membership: Membership::NonVoter,
            },
            completion,
        })
        .await;
    node.ack("b", 3).await;
    assert_eq!(change_rx.try_recv().unwrap(), Ok(()));
    assert_eq!(node.state.topology.index, 3);
    node.network.take();

    let mut rejection = node.append_ack("c", 0);
    rejection.success = false;
    node.state.next_index.insert("c".into(), 2);
    node.state
        .handle_event(Event::AppendEntriesResponse(rejection))
        .await;
    let accept = CanInstallSnapshotResponse {
        term: node.state.current_term,
        index: 2,
        success: true,
        is_currently_installing: false,
        message: String::new(),
        from: "c".into(),
        cluster_topology_id: node.topology_id(),
    };
    node.state
        .handle_event(Event::CanInstallSnapshotResponse(accept))
        .await;

    let install = node
        .network
        .take()
        .into_iter()
        .find_map(|(to, m)| match m {
            Sent::Install(request) if to == "c" => Some(request),
            _ => None,
        })
        .expect("snapshot streamed to c");
    assert_eq!(install.last_included_index, 2);
    assert_eq!(install.topology.index, 0);
    assert!(!install.topology.contains("d"));
    let saved = node.storage.load_snapshot_meta().await.unwrap().unwrap();
    assert_eq!(saved.topology, install.topology);
}

#[tokio::test]
async fn test_follower_repairs_gap_after_retry() {
    let history: Vec<LogEntry> = (1..=9).map(|i| entry(i, 5)).collect();
    let mut node = create_test_node_with_log(
        "b",
        three_node_topology(),
        HardState { term: 5, voted_for: None },
        &history,
    )
    .await;
    let cluster = node.topology_id();

    let response = node
        .append_entries(append_request("a", 5, (10, 5), vec![entry(11, 5)], 9, cluster))
        .await;
    assert!(!response.success);
    assert_eq!(response.last_log_index, 9);

    let response = node
        .append_entries(append_request(
            "a",
            5,
            (9, 5),
            vec![entry(10, 5), entry(11, 5)],
            9,
            cluster,
        ))
        .await;
    assert!(response.success);
    assert_eq!(response.last_log_index, 11);
    assert_eq!(node.state.last_log_index, 11);
    assert_eq!(node.state.get_commit_index(), 9);
}

#[tokio::test]
async fn test_removed_leader_steps_down() {
    let mut node = create_test_node("a", three_node_topology()).await;
    node.elect().await;
    assert!(node.state.heartbeat_timer.is_some());
    let cluster = node.topology_id();

    node.state
        .handle_event(Event::DisconnectedFromCluster(DisconnectedFromCluster {
            term: node.state.current_term,
            topology_index: 2,
            from: "b".into(),
            cluster_topology_id: cluster,
        }))
        .await;

    assert_eq!(node.state.get_role(), Role::Follower);
    assert!(node.state.heartbeat_timer.is_none());
    assert!(node.state.topology.is_empty());
}
