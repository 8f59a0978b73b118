use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, TopologyError};
use crate::types::{NodeConnectionInfo, NodeName, TopologyId};

/// Which set of the topology a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Voter,
    NonVoter,
    /// Receives the log as a non-voter and is promoted to voter once caught up.
    Promotable,
}

/// A proposed membership change. Applied to the current topology to produce the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyChange {
    Add {
        node: NodeConnectionInfo,
        membership: Membership,
    },
    Promote {
        name: NodeName,
    },
    Remove {
        name: NodeName,
    },
}

// === 集群拓扑 ===
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub topology_id: TopologyId,
    /// Log index of the entry that introduced this topology; 0 before any change.
    pub index: u64,
    pub voting_nodes: BTreeMap<NodeName, NodeConnectionInfo>,
    pub non_voting_nodes: BTreeMap<NodeName, NodeConnectionInfo>,
    pub promotable_nodes: BTreeMap<NodeName, NodeConnectionInfo>,
}

impl Topology {
    /// A topology without members. A node holding one is not part of any cluster yet.
    pub fn new(topology_id: TopologyId) -> Self {
        Self {
            topology_id,
            index: 0,
            voting_nodes: BTreeMap::new(),
            non_voting_nodes: BTreeMap::new(),
            promotable_nodes: BTreeMap::new(),
        }
    }

    /// Single-voter topology for a node that founds a new cluster.
    pub fn bootstrap(node: NodeConnectionInfo) -> Self {
        Self::with_voters(TopologyId::new(), [node])
    }

    pub fn with_voters(
        topology_id: TopologyId,
        voters: impl IntoIterator<Item = NodeConnectionInfo>,
    ) -> Self {
        let mut topology = Self::new(topology_id);
        for node in voters {
            topology.voting_nodes.insert(node.name.clone(), node);
        }
        topology
    }

    pub fn is_empty(&self) -> bool {
        self.voting_nodes.is_empty()
            && self.non_voting_nodes.is_empty()
            && self.promotable_nodes.is_empty()
    }

    pub fn membership(&self, name: &str) -> Option<Membership> {
        if self.voting_nodes.contains_key(name) {
            Some(Membership::Voter)
        } else if self.non_voting_nodes.contains_key(name) {
            Some(Membership::NonVoter)
        } else if self.promotable_nodes.contains_key(name) {
            Some(Membership::Promotable)
        } else {
            None
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.membership(name).is_some()
    }

    pub fn is_voter(&self, name: &str) -> bool {
        self.voting_nodes.contains_key(name)
    }

    pub fn get_node(&self, name: &str) -> Option<&NodeConnectionInfo> {
        self.voting_nodes
            .get(name)
            .or_else(|| self.non_voting_nodes.get(name))
            .or_else(|| self.promotable_nodes.get(name))
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeConnectionInfo> {
        self.voting_nodes
            .values()
            .chain(self.non_voting_nodes.values())
            .chain(self.promotable_nodes.values())
    }

    pub fn voters(&self) -> impl Iterator<Item = &NodeName> {
        self.voting_nodes.keys()
    }

    pub fn quorum(&self) -> usize {
        self.voting_nodes.len() / 2 + 1
    }

    /// True when the given nodes include a majority of the voting set.
    pub fn has_quorum<'a>(&self, granted: impl IntoIterator<Item = &'a NodeName>) -> bool {
        if self.voting_nodes.is_empty() {
            return false;
        }
        let voters: HashSet<&NodeName> = granted
            .into_iter()
            .filter(|name| self.voting_nodes.contains_key(name.as_str()))
            .collect();
        voters.len() >= self.quorum()
    }

    /// Produces the topology that results from `change`, keeping the topology id.
    pub fn apply_change(&self, change: &TopologyChange) -> Result<Topology, TopologyError> {
        let mut next = self.clone();
        match change {
            TopologyChange::Add { node, membership } => {
                if self.membership(&node.name) == Some(*membership)
                    && self.get_node(&node.name) == Some(node)
                {
                    return Err(TopologyError::AlreadyMember(node.name.clone()));
                }
                next.remove_node(&node.name);
                let target = match membership {
                    Membership::Voter => &mut next.voting_nodes,
                    Membership::NonVoter => &mut next.non_voting_nodes,
                    Membership::Promotable => &mut next.promotable_nodes,
                };
                target.insert(node.name.clone(), node.clone());
            }
            TopologyChange::Promote { name } => {
                let node = next
                    .promotable_nodes
                    .remove(name)
                    .ok_or_else(|| TopologyError::NotPromotable(name.clone()))?;
                next.voting_nodes.insert(name.clone(), node);
            }
            TopologyChange::Remove { name } => {
                if !self.contains(name) {
                    return Err(TopologyError::UnknownNode(name.clone()));
                }
                if self.is_voter(name) && self.voting_nodes.len() == 1 {
                    return Err(TopologyError::LastVoter(name.clone()));
                }
                next.remove_node(name);
            }
        }
        Ok(next)
    }

    fn remove_node(&mut self, name: &str) -> Option<NodeConnectionInfo> {
        self.voting_nodes
            .remove(name)
            .or_else(|| self.non_voting_nodes.remove(name))
            .or_else(|| self.promotable_nodes.remove(name))
    }

    /// Payload of a topology-change log entry.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(data)?)
    }
}
