// test_cluster.rs
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raft_cluster::cluster::ClusterStateMachine;
use raft_cluster::storage::MemoryStorage;
use raft_cluster::transport::{MemoryNetwork, MemoryNetworkConfig};
use raft_cluster::{NodeConnectionInfo, NodeName, RaftOptions, Role, Topology, TopologyId};
use tracing::{info, warn};

use super::eventually;
use super::test_node::TestNode;

pub fn node_info(name: &str) -> NodeConnectionInfo {
    NodeConnectionInfo::new(name, format!("mem://{}", name))
}

/// Timeouts short enough for tests on the in-memory network.
pub fn fast_options() -> RaftOptions {
    RaftOptions {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(30),
        leader_transfer_timeout: Duration::from_secs(3),
        ..RaftOptions::default()
    }
}

#[derive(Clone)]
pub struct TestCluster {
    pub network: MemoryNetwork,
    options: RaftOptions,
    nodes: Arc<Mutex<BTreeMap<NodeName, TestNode>>>,
}

impl TestCluster {
    /// Starts `names` as the voters of one freshly bootstrapped cluster.
    pub async fn new(names: &[&str]) -> Self {
        Self::with_options(names, fast_options()).await
    }

    pub async fn with_options(names: &[&str], options: RaftOptions) -> Self {
        let cluster = TestCluster {
            network: MemoryNetwork::new(MemoryNetworkConfig::default()),
            options,
            nodes: Arc::new(Mutex::new(BTreeMap::new())),
        };

        let topology = Topology::with_voters(TopologyId::new(), names.iter().map(|n| node_info(n)));
        for name in names {
            let options = RaftOptions {
                initial_topology: Some(topology.clone()),
                ..cluster.options.clone()
            };
            cluster.spawn(name, options).await;
        }
        info!("TestCluster created with {} nodes", names.len());
        cluster
    }

    /// Starts a node that belongs to no cluster yet.
    pub async fn add_fresh_node(&self, name: &str) -> TestNode {
        self.spawn(name, self.options.clone()).await
    }

    /// Starts a node that founds a single-node cluster of its own.
    pub async fn add_bootstrapped_node(&self, name: &str) -> TestNode {
        let options = RaftOptions {
            initial_topology: Some(Topology::bootstrap(node_info(name))),
            ..self.options.clone()
        };
        self.spawn(name, options).await
    }

    async fn spawn(&self, name: &str, options: RaftOptions) -> TestNode {
        let node = TestNode::start(
            node_info(name),
            &self.network,
            options,
            MemoryStorage::new(),
            Arc::new(ClusterStateMachine::new(name)),
        )
        .await
        .unwrap_or_else(|e| panic!("Failed to create node {}: {}", name, e));
        self.nodes.lock().insert(name.to_string(), node.clone());
        node
    }

    pub fn node(&self, name: &str) -> TestNode {
        self.nodes
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("unknown node {}", name))
    }

    pub fn nodes(&self) -> Vec<TestNode> {
        self.nodes.lock().values().cloned().collect()
    }

    /// Stops a node and starts it again on the same storage and state machine.
    pub async fn restart(&self, name: &str) -> TestNode {
        let old = self.node(name);
        old.stop(&self.network).await;
        let node = TestNode::start(
            old.info.clone(),
            &self.network,
            self.options.clone(),
            old.storage.clone(),
            old.state_machine.clone(),
        )
        .await
        .unwrap_or_else(|e| panic!("Failed to restart node {}: {}", name, e));
        self.nodes.lock().insert(name.to_string(), node.clone());
        node
    }

    /// Waits for a leader that every reachable running node agrees on.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeName> {
        let mut leader = None;
        let found = eventually(timeout, || {
            leader = self.agreed_leader();
            leader.is_some()
        })
        .await;
        if !found {
            warn!("No agreed leader after {:?}", timeout);
        }
        leader
    }

    fn agreed_leader(&self) -> Option<NodeName> {
        let nodes: Vec<TestNode> = self
            .nodes()
            .into_iter()
            .filter(|n| n.engine.is_running() && !self.network.is_isolated(n.name()))
            .filter(|n| !n.status().topology.is_empty())
            .collect();
        let leader = nodes.iter().find(|n| n.engine.is_leader())?.info.name.clone();
        nodes
            .iter()
            .all(|n| n.status().leader.as_ref() == Some(&leader))
            .then_some(leader)
    }

    /// `(term, name)` of every node currently reporting itself leader.
    pub fn current_leaders(&self) -> Vec<(u64, NodeName)> {
        self.nodes()
            .into_iter()
            .map(|n| n.status())
            .filter(|status| status.role == Role::Leader)
            .map(|status| (status.term, status.name))
            .collect()
    }

    /// Waits until every named node applied at least `index`.
    pub async fn wait_for_applied(&self, names: &[&str], index: u64, timeout: Duration) -> bool {
        let nodes: Vec<TestNode> = names.iter().map(|n| self.node(n)).collect();
        eventually(timeout, || {
            nodes
                .iter()
                .all(|n| n.status().last_applied >= index)
        })
        .await
    }

    pub fn isolate(&self, name: &str) {
        self.network.isolate(name);
    }

    pub fn restore(&self, name: &str) {
        self.network.restore(name);
    }

    pub async fn shutdown(&self) {
        for node in self.nodes() {
            node.stop(&self.network).await;
        }
    }
}
