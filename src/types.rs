use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

// Type aliases
pub type NodeName = String;
pub type TimerId = u64;

/// Connection details of a cluster member. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeConnectionInfo {
    pub name: NodeName,
    pub uri: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl NodeConnectionInfo {
    pub fn new(name: impl Into<NodeName>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

impl Display for NodeConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uri)
    }
}

/// Identifies a cluster. Stays the same across membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyId(Uuid);

impl TopologyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TopologyId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TopologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TopologyId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}
